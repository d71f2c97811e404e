//! Multi-line rendering used by notebook and REPL collaborators: two-space
//! indent per nesting level, object keys sorted, map and set keys sorted by
//! their stringified form, empty containers collapsed.

use crate::runtime::value::Value;

pub fn pretty(value: &Value, indent: usize) -> String {
    match value {
        Value::Array(arr) => {
            let elements = arr.lock().unwrap().clone();
            if elements.is_empty() {
                return "[]".to_string();
            }
            let inner = "  ".repeat(indent + 1);
            let mut out = String::from("[\n");
            for (i, element) in elements.iter().enumerate() {
                out.push_str(&inner);
                out.push_str(&pretty(element, indent + 1));
                if i + 1 < elements.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            out.push_str(&"  ".repeat(indent));
            out.push(']');
            out
        }
        Value::Object(obj) => pretty_pairs(&obj.lock().unwrap().clone(), indent),
        Value::Module(env) => pretty_pairs(&env.snapshot(), indent),
        Value::Map(map) => {
            let pairs = map.lock().unwrap().clone();
            if pairs.is_empty() {
                return "map{}".to_string();
            }
            let mut rendered: Vec<(String, Value)> = pairs
                .into_iter()
                .map(|(k, v)| (k.display(), v))
                .collect();
            rendered.sort_by(|a, b| a.0.cmp(&b.0));
            let inner = "  ".repeat(indent + 1);
            let mut out = String::from("map{\n");
            let last = rendered.len() - 1;
            for (i, (key, value)) in rendered.iter().enumerate() {
                out.push_str(&inner);
                out.push_str(key);
                out.push_str(": ");
                out.push_str(&pretty(value, indent + 1));
                if i < last {
                    out.push(',');
                }
                out.push('\n');
            }
            out.push_str(&"  ".repeat(indent));
            out.push('}');
            out
        }
        Value::Set(set) => {
            let elements = set.lock().unwrap().clone();
            if elements.is_empty() {
                return "set{}".to_string();
            }
            let mut keys: Vec<String> = elements.iter().map(|k| k.display()).collect();
            keys.sort();
            let inner = "  ".repeat(indent + 1);
            let mut out = String::from("set{\n");
            let last = keys.len() - 1;
            for (i, key) in keys.iter().enumerate() {
                out.push_str(&inner);
                out.push_str(key);
                if i < last {
                    out.push(',');
                }
                out.push('\n');
            }
            out.push_str(&"  ".repeat(indent));
            out.push('}');
            out
        }
        other => other.inspect(),
    }
}

fn pretty_pairs(
    pairs: &std::collections::HashMap<String, Value>,
    indent: usize,
) -> String {
    if pairs.is_empty() {
        return "{}".to_string();
    }
    let mut keys: Vec<&String> = pairs.keys().collect();
    keys.sort();
    let inner = "  ".repeat(indent + 1);
    let mut out = String::from("{\n");
    let last = keys.len() - 1;
    for (i, key) in keys.iter().enumerate() {
        out.push_str(&inner);
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&pretty(&pairs[*key], indent + 1));
        if i < last {
            out.push(',');
        }
        out.push('\n');
    }
    out.push_str(&"  ".repeat(indent));
    out.push('}');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_containers_collapse() {
        assert_eq!(pretty(&Value::array(vec![]), 0), "[]");
        assert_eq!(pretty(&Value::object(HashMap::new()), 0), "{}");
        assert_eq!(pretty(&Value::empty_map(), 0), "map{}");
        assert_eq!(pretty(&Value::empty_set(), 0), "set{}");
    }

    #[test]
    fn nested_values_indent_two_spaces() {
        let mut inner = HashMap::new();
        inner.insert("b".to_string(), Value::Integer(2));
        inner.insert("a".to_string(), Value::Integer(1));
        let value = Value::array(vec![Value::object(inner), Value::Integer(3)]);
        assert_eq!(
            pretty(&value, 0),
            "[\n  {\n    a: 1,\n    b: 2\n  },\n  3\n]"
        );
    }

    #[test]
    fn map_keys_sort_by_rendering() {
        let map = Value::empty_map();
        if let Value::Map(m) = &map {
            let mut m = m.lock().unwrap();
            m.insert(
                crate::runtime::value::MapKey::for_value(&Value::Integer(10)).unwrap(),
                Value::Integer(1),
            );
            m.insert(
                crate::runtime::value::MapKey::for_value(&Value::Integer(2)).unwrap(),
                Value::Integer(2),
            );
        }
        assert_eq!(pretty(&map, 0), "map{\n  10: 1,\n  2: 2\n}");
    }
}
