use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::language::ast::Program;
use crate::runtime::error::Error;

/// Parser collaborator hook: (source, filename) to a parsed program, or a
/// fully formatted aggregate of parse errors.
pub type ParseFn = Arc<dyn Fn(&str, &str) -> Result<Program, String> + Send + Sync>;

/// A parsed module. Only the parse result is cached; evaluation happens anew
/// on every factory call.
#[derive(Debug)]
pub struct ModuleDefinition {
    pub program: Program,
    pub source: String,
    pub filename: String,
}

/// Process-wide load cache with in-flight tracking for cycle detection.
/// Concurrent imports from different tasks are legal; the mutex covers only
/// the bookkeeping, not file I/O or parsing.
pub struct ModuleState {
    inner: Mutex<State>,
}

struct State {
    loaded: HashMap<PathBuf, Arc<ModuleDefinition>>,
    loading: HashSet<PathBuf>,
}

impl ModuleState {
    pub fn new() -> ModuleState {
        ModuleState {
            inner: Mutex::new(State {
                loaded: HashMap::new(),
                loading: HashSet::new(),
            }),
        }
    }

    pub fn load(&self, path: &Path, parse: &ParseFn) -> Result<Arc<ModuleDefinition>, Error> {
        let resolved = absolutize(path);

        {
            let mut state = self.inner.lock().unwrap();
            if let Some(module) = state.loaded.get(&resolved) {
                debug!(path = %resolved.display(), "module cache hit");
                return Ok(module.clone());
            }
            if state.loading.contains(&resolved) {
                return Err(Error::runtime(format!(
                    "circular import: {}",
                    resolved.display()
                )));
            }
            state.loading.insert(resolved.clone());
        }

        let result = self.read_and_parse(&resolved, parse);

        let mut state = self.inner.lock().unwrap();
        state.loading.remove(&resolved);
        let module = result?;
        state.loaded.insert(resolved, module.clone());
        Ok(module)
    }

    fn read_and_parse(
        &self,
        resolved: &Path,
        parse: &ParseFn,
    ) -> Result<Arc<ModuleDefinition>, Error> {
        let filename = resolved.display().to_string();
        let source = std::fs::read_to_string(resolved)
            .map_err(|e| Error::runtime(format!("import read error: {}", e)))?;
        debug!(path = %filename, bytes = source.len(), "loading module");
        let program = parse(&source, &filename).map_err(Error::Module)?;
        Ok(Arc::new(ModuleDefinition {
            program,
            source,
            filename,
        }))
    }
}

impl Default for ModuleState {
    fn default() -> Self {
        Self::new()
    }
}

/// Where an import path points. Absolute paths stand as written; `./` and
/// `../` resolve against the importing file when its name is known and real;
/// everything else resolves against the project root, falling back to the
/// process working directory.
pub fn resolve_import_path(
    path: &str,
    importer_filename: &str,
    project_root: Option<&Path>,
) -> PathBuf {
    let raw = Path::new(path);
    if raw.is_absolute() {
        return raw.to_path_buf();
    }
    if (path.starts_with("./") || path.starts_with("../"))
        && !importer_filename.is_empty()
        && importer_filename != "<stdin>"
    {
        let importer_dir = Path::new(importer_filename)
            .parent()
            .unwrap_or_else(|| Path::new("."));
        return importer_dir.join(raw);
    }
    let root = match project_root {
        Some(root) => root.to_path_buf(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    root.join(raw)
}

/// Lexically normalize, then anchor relative paths at the working directory.
fn absolutize(path: &Path) -> PathBuf {
    let anchored = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    let mut out = PathBuf::new();
    for component in anchored.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn empty_parser() -> ParseFn {
        Arc::new(|_, _| Ok(Program::default()))
    }

    fn write_module(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn repeated_loads_reuse_the_definition() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), "m.k", "let a = 1\n");
        let state = ModuleState::new();
        let parse = empty_parser();

        let first = state.load(&path, &parse).unwrap();
        let second = state.load(&path, &parse).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.source, "let a = 1\n");
    }

    #[test]
    fn missing_file_reports_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = ModuleState::new();
        let err = state
            .load(&dir.path().join("nope.k"), &empty_parser())
            .unwrap_err();
        assert!(err.to_string().contains("import read error"));
    }

    #[test]
    fn parse_failures_surface_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), "bad.k", "let\n");
        let state = ModuleState::new();
        let parse: ParseFn = Arc::new(|_, file| Err(format!("parse error in {}", file)));
        match state.load(&path, &parse) {
            Err(Error::Module(msg)) => assert!(msg.starts_with("parse error in")),
            other => panic!("unexpected: {other:?}"),
        }
        // A failed load leaves no cache entry or in-flight marker behind.
        assert!(state.load(&path, &empty_parser()).is_ok());
    }

    #[test]
    fn self_import_is_reported_as_a_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), "loop.k", "import \"loop.k\"\n");
        let state = Arc::new(ModuleState::new());

        let reentrant_state = state.clone();
        let reentrant_path = path.clone();
        let parse: ParseFn = Arc::new(move |_, _| {
            let inner: ParseFn = Arc::new(|_, _| Ok(Program::default()));
            match reentrant_state.load(&reentrant_path, &inner) {
                Err(e) => Err(e.to_string()),
                Ok(_) => Ok(Program::default()),
            }
        });

        let err = state.load(&path, &parse).unwrap_err();
        assert!(err.to_string().contains("circular import"));
    }

    #[test]
    fn relative_imports_follow_the_importer() {
        let resolved = resolve_import_path("./util.k", "/proj/src/main.k", None);
        assert_eq!(resolved, PathBuf::from("/proj/src/./util.k"));

        let from_stdin = resolve_import_path("./util.k", "<stdin>", Some(Path::new("/proj")));
        assert_eq!(from_stdin, PathBuf::from("/proj/./util.k"));

        let bare = resolve_import_path("lib/util.k", "/proj/src/main.k", Some(Path::new("/proj")));
        assert_eq!(bare, PathBuf::from("/proj/lib/util.k"));

        let absolute = resolve_import_path("/abs/m.k", "", None);
        assert_eq!(absolute, PathBuf::from("/abs/m.k"));
    }
}
