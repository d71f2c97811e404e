//! End-to-end scenarios driving the evaluator over hand-built ASTs, the way
//! the parser collaborator would feed it. Log output is captured through the
//! runtime's buffered sink.

use std::sync::Arc;

use crate::language::ast::*;
use crate::language::token::Token;
use crate::runtime::environment::Environment;
use crate::runtime::error::Error;
use crate::runtime::evaluator::Evaluator;
use crate::runtime::modules::ParseFn;
use crate::runtime::task::Runtime;
use crate::runtime::value::Value;

fn t() -> Token {
    Token::default()
}

fn int(value: i64) -> Expression {
    Expression::Integer(IntegerLiteral { token: t(), value })
}

fn float(value: f64) -> Expression {
    Expression::Float(FloatLiteral { token: t(), value })
}

fn string(value: &str) -> Expression {
    Expression::Str(StringLiteral {
        token: t(),
        value: value.to_string(),
    })
}

fn ident(name: &str) -> Expression {
    Expression::Identifier(Identifier {
        token: t(),
        name: name.to_string(),
    })
}

fn ident_pat(name: &str) -> Pattern {
    Pattern::Identifier(Identifier {
        token: t(),
        name: name.to_string(),
    })
}

fn let_stmt(name: &str, value: Expression) -> Statement {
    Statement::Let(LetStatement {
        token: t(),
        pattern: ident_pat(name),
        value,
    })
}

fn expr_stmt(expression: Expression) -> Statement {
    Statement::Expression(ExpressionStatement {
        token: t(),
        expression,
    })
}

fn infix(operator: InfixOp, left: Expression, right: Expression) -> Expression {
    Expression::Infix(Box::new(InfixExpression {
        token: t(),
        operator,
        left,
        right,
    }))
}

fn prefix(operator: PrefixOp, right: Expression) -> Expression {
    Expression::Prefix(Box::new(PrefixExpression {
        token: t(),
        operator,
        right,
    }))
}

fn assign(operator: AssignOp, target: Expression, value: Expression) -> Expression {
    Expression::Assign(Box::new(AssignExpression {
        token: t(),
        operator,
        target,
        value,
    }))
}

fn postfix(operator: PostfixOp, target: Expression) -> Expression {
    Expression::Postfix(Box::new(PostfixExpression {
        token: t(),
        operator,
        target,
    }))
}

fn call(function: Expression, arguments: Vec<Expression>) -> Expression {
    Expression::Call(Box::new(CallExpression {
        token: t(),
        function,
        arguments,
    }))
}

fn member(object: Expression, property: &str) -> Expression {
    Expression::Member(Box::new(MemberExpression {
        token: t(),
        object,
        property: Identifier {
            token: t(),
            name: property.to_string(),
        },
    }))
}

fn array(elements: Vec<Expression>) -> Expression {
    Expression::Array(ArrayLiteral {
        token: t(),
        elements,
    })
}

fn block(statements: Vec<Statement>) -> Expression {
    Expression::Block(BlockExpression {
        token: t(),
        statements,
    })
}

fn if_expr(
    condition: Expression,
    consequence: Expression,
    alternative: Option<Expression>,
) -> Expression {
    Expression::If(Box::new(IfExpression {
        token: t(),
        condition,
        consequence,
        alternative,
    }))
}

fn lambda(parameters: Vec<Pattern>, body: Expression) -> Expression {
    Expression::Lambda(Box::new(LambdaExpression {
        token: t(),
        parameters,
        body,
    }))
}

fn spawn(body: Expression) -> Expression {
    Expression::Spawn(Box::new(SpawnExpression { token: t(), body }))
}

fn await_expr(value: Expression) -> Expression {
    Expression::Await(Box::new(AwaitExpression { token: t(), value }))
}

fn race(tasks: Vec<Expression>) -> Expression {
    Expression::Race(RaceExpression { token: t(), tasks })
}

fn break_expr(value: Option<Expression>) -> Expression {
    Expression::Break(Box::new(BreakExpression { token: t(), value }))
}

fn recover(target: Expression, fallback: Expression) -> Expression {
    Expression::Recover(Box::new(RecoverExpression {
        token: t(),
        target,
        fallback,
    }))
}

fn program(statements: Vec<Statement>) -> Program {
    Program { statements }
}

struct Harness {
    runtime: Arc<Runtime>,
    evaluator: Evaluator,
    env: Environment,
}

impl Harness {
    fn new() -> Harness {
        Self::with_evaluator(|ev| ev)
    }

    fn with_evaluator(configure: impl FnOnce(Evaluator) -> Evaluator) -> Harness {
        let runtime = Arc::new(Runtime::new().with_buffered_output());
        let evaluator = configure(Evaluator::new(runtime.clone()));
        let env = Environment::new_enclosed(&evaluator.base_environment());
        Harness {
            runtime,
            evaluator,
            env,
        }
    }

    fn run(&self, statements: Vec<Statement>) -> Result<Value, Error> {
        self.evaluator.evaluate(&program(statements), &self.env)
    }

    fn output(&self) -> String {
        self.runtime.take_output()
    }
}

fn log_of(expr: Expression) -> Statement {
    expr_stmt(call(ident("log"), vec![expr]))
}

#[test]
fn s1_arithmetic_precedence_and_types() {
    let h = Harness::new();
    h.run(vec![
        let_stmt("a", infix(InfixOp::Add, int(1), infix(InfixOp::Mul, int(2), int(3)))),
        log_of(ident("a")),
        let_stmt("b", infix(InfixOp::Div, int(1), int(2))),
        log_of(ident("b")),
        let_stmt("c", infix(InfixOp::Rem, int(7), int(2))),
        log_of(ident("c")),
    ])
    .unwrap();
    assert_eq!(h.output(), "7\n0.5\n1\n");

    let err = h
        .run(vec![let_stmt("d", infix(InfixOp::Rem, float(7.0), int(2)))])
        .unwrap_err();
    assert_eq!(err.to_string(), "modulo requires integers");
}

#[test]
fn s2_for_loop_with_break() {
    let h = Harness::new();
    let body = block(vec![
        expr_stmt(if_expr(
            infix(InfixOp::Eq, ident("i"), int(3)),
            block(vec![expr_stmt(break_expr(None))]),
            None,
        )),
        expr_stmt(assign(AssignOp::AddAssign, ident("sum"), ident("i"))),
    ]);
    let loop_expr = Expression::For(Box::new(ForExpression {
        token: t(),
        bindings: vec![ForBinding {
            pattern: ident_pat("i"),
            value: int(0),
        }],
        condition: infix(InfixOp::Lt, ident("i"), int(5)),
        update: Some(postfix(PostfixOp::Increment, ident("i"))),
        body,
        then: None,
    }));
    h.run(vec![
        let_stmt("sum", int(0)),
        expr_stmt(loop_expr),
        log_of(ident("sum")),
    ])
    .unwrap();
    assert_eq!(h.output(), "3\n");
}

#[test]
fn for_loop_break_value_and_then_tail() {
    let h = Harness::new();
    let loop_expr = Expression::For(Box::new(ForExpression {
        token: t(),
        bindings: vec![ForBinding {
            pattern: ident_pat("i"),
            value: int(0),
        }],
        condition: infix(InfixOp::Lt, ident("i"), int(10)),
        update: Some(postfix(PostfixOp::Increment, ident("i"))),
        body: block(vec![expr_stmt(if_expr(
            infix(InfixOp::Eq, ident("i"), int(4)),
            block(vec![expr_stmt(break_expr(Some(infix(
                InfixOp::Mul,
                ident("i"),
                int(10),
            ))))]),
            None,
        ))]),
        then: Some(int(-1)),
    }));
    let value = h.run(vec![expr_stmt(loop_expr)]).unwrap();
    assert!(matches!(value, Value::Integer(40)));

    // Without a break the loop falls through to its then-tail.
    let exhausted = Expression::For(Box::new(ForExpression {
        token: t(),
        bindings: vec![ForBinding {
            pattern: ident_pat("i"),
            value: int(0),
        }],
        condition: infix(InfixOp::Lt, ident("i"), int(2)),
        update: Some(postfix(PostfixOp::Increment, ident("i"))),
        body: block(vec![]),
        then: Some(int(-1)),
    }));
    let value = h.run(vec![expr_stmt(exhausted)]).unwrap();
    assert!(matches!(value, Value::Integer(-1)));
}

#[test]
fn s3_spawn_await_race() {
    let h = Harness::new();
    h.run(vec![
        let_stmt(
            "a",
            spawn(block(vec![
                expr_stmt(call(ident("sleep"), vec![int(300)])),
                expr_stmt(int(1)),
            ])),
        ),
        let_stmt(
            "b",
            spawn(block(vec![
                expr_stmt(call(ident("sleep"), vec![int(10)])),
                expr_stmt(int(2)),
            ])),
        ),
        log_of(race(vec![ident("a"), ident("b")])),
    ])
    .unwrap();
    assert_eq!(h.output(), "2\n");

    // The race loser was canceled; awaiting it reports the cancellation.
    let err = h.run(vec![expr_stmt(await_expr(ident("a")))]).unwrap_err();
    assert!(err.is_canceled(), "expected canceled, got {err:?}");
}

#[test]
fn s4_channel_rendezvous() {
    let h = Harness::new();
    h.run(vec![
        let_stmt("c", call(ident("channel"), vec![])),
        expr_stmt(spawn(call(ident("send"), vec![ident("c"), int(42)]))),
        let_stmt("r", call(ident("recv"), vec![ident("c")])),
        log_of(ident("r")),
        expr_stmt(call(ident("done"), vec![ident("c")])),
        log_of(call(ident("recv"), vec![ident("c")])),
    ])
    .unwrap();
    assert_eq!(h.output(), "[42, false]\n[null, true]\n");
}

#[test]
fn s5_recover_catches_fail() {
    let h = Harness::new();
    let value = h
        .run(vec![expr_stmt(recover(
            call(ident("fail"), vec![string("oops")]),
            block(vec![log_of(ident("error")), expr_stmt(string("ok"))]),
        ))])
        .unwrap();
    assert_eq!(value.inspect(), "\"ok\"");
    assert_eq!(h.output(), "{kind: \"fail\", message: \"oops\"}\n");
}

#[test]
fn s6_unhandled_task_failure_goes_fatal() {
    let h = Harness::new();
    let err = h
        .run(vec![
            expr_stmt(spawn(infix(InfixOp::Rem, int(7), int(0)))),
            expr_stmt(call(ident("sleep"), vec![int(2000)])),
        ])
        .unwrap_err();
    // The fatal signal interrupts the sleeping main task with the aggregate.
    assert!(matches!(&err, Error::UnhandledTasks(_)), "got {err:?}");

    let unhandled = h.evaluator.check_unhandled_task_failures().unwrap();
    assert_eq!(unhandled.messages.len(), 1);
    assert!(unhandled.messages[0].contains("division by zero"));
}

#[test]
fn s7_module_factory_builds_fresh_instances() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("m.k"), "let counter = 0\n").unwrap();

    // Stand-in for the parser collaborator: the module body is `let counter = 0`.
    let parse: ParseFn = Arc::new(|_source, _file| {
        Ok(program(vec![let_stmt("counter", int(0))]))
    });

    let root = dir.path().to_path_buf();
    let h = Harness::with_evaluator(move |ev| ev.with_parser(parse).with_project_root(root));
    h.run(vec![
        let_stmt("make", Expression::Import(Box::new(ImportExpression {
            token: t(),
            path: StringLiteral {
                token: t(),
                value: "m.k".to_string(),
            },
        }))),
        let_stmt("m1", call(ident("make"), vec![])),
        let_stmt("m2", call(ident("make"), vec![])),
        expr_stmt(assign(AssignOp::Assign, member(ident("m1"), "counter"), int(5))),
        log_of(member(ident("m2"), "counter")),
        log_of(member(ident("m1"), "counter")),
    ])
    .unwrap();
    assert_eq!(h.output(), "0\n5\n");
}

#[test]
fn truthy_negation_always_yields_boolean() {
    let h = Harness::new();
    let samples = vec![
        int(0),
        int(3),
        float(0.0),
        string(""),
        string("x"),
        Expression::Null(t()),
        Expression::Unit(t()),
        array(vec![]),
        array(vec![int(1)]),
    ];
    for sample in samples {
        let negated = h.run(vec![expr_stmt(prefix(PrefixOp::Not, sample.clone()))]);
        let direct = h.run(vec![expr_stmt(sample)]);
        let negated = match negated.unwrap() {
            Value::Boolean(b) => b,
            other => panic!("negation produced {other:?}"),
        };
        assert_eq!(negated, !direct.unwrap().is_truthy());
    }
}

#[test]
fn match_arms_bind_guard_and_fall_through() {
    let h = Harness::new();
    let match_expr = Expression::Match(Box::new(MatchExpression {
        token: t(),
        value: int(10),
        arms: vec![
            MatchArm {
                pattern: ident_pat("n"),
                guard: Some(infix(InfixOp::Gt, ident("n"), int(100))),
                body: string("big"),
            },
            MatchArm {
                pattern: ident_pat("n"),
                guard: Some(infix(InfixOp::Gt, ident("n"), int(5))),
                body: string("medium"),
            },
            MatchArm {
                pattern: Pattern::Wildcard(t()),
                guard: None,
                body: string("small"),
            },
        ],
    }));
    let value = h.run(vec![expr_stmt(match_expr)]).unwrap();
    assert_eq!(value.inspect(), "\"medium\"");

    let no_arms = Expression::Match(Box::new(MatchExpression {
        token: t(),
        value: int(1),
        arms: vec![MatchArm {
            pattern: Pattern::Integer(IntegerLiteral { token: t(), value: 2 }),
            guard: None,
            body: string("never"),
        }],
    }));
    let err = h.run(vec![expr_stmt(no_arms)]).unwrap_err();
    assert_eq!(err.to_string(), "non-exhaustive match");
}

#[test]
fn query_filters_sorts_and_projects() {
    let h = Harness::new();
    let query = Expression::Query(Box::new(QueryExpression {
        token: t(),
        var: Identifier {
            token: t(),
            name: "x".to_string(),
        },
        source: array(vec![int(3), int(1), int(2)]),
        wheres: vec![infix(InfixOp::GtEq, ident("x"), int(2))],
        order_by: Some(ident("x")),
        select: infix(InfixOp::Mul, ident("x"), int(10)),
    }));
    let value = h.run(vec![expr_stmt(query)]).unwrap();
    assert_eq!(value.inspect(), "[20, 30]");

    let mixed_keys = Expression::Query(Box::new(QueryExpression {
        token: t(),
        var: Identifier {
            token: t(),
            name: "x".to_string(),
        },
        source: array(vec![int(1), string("two")]),
        wheres: vec![],
        order_by: Some(ident("x")),
        select: ident("x"),
    }));
    let err = h.run(vec![expr_stmt(mixed_keys)]).unwrap_err();
    assert_eq!(err.to_string(), "orderby keys must be the same type");
}

#[test]
fn slices_normalize_negative_bounds() {
    let h = Harness::new();
    let arr = array(vec![int(1), int(2), int(3), int(4)]);
    let middle = Expression::Slice(Box::new(SliceExpression {
        token: t(),
        left: arr.clone(),
        start: Some(int(1)),
        end: Some(int(3)),
    }));
    assert_eq!(h.run(vec![expr_stmt(middle)]).unwrap().inspect(), "[2, 3]");

    let tail = Expression::Slice(Box::new(SliceExpression {
        token: t(),
        left: arr.clone(),
        start: Some(int(-2)),
        end: None,
    }));
    assert_eq!(h.run(vec![expr_stmt(tail)]).unwrap().inspect(), "[3, 4]");

    let out_of_range = Expression::Slice(Box::new(SliceExpression {
        token: t(),
        left: arr,
        start: Some(int(0)),
        end: Some(int(9)),
    }));
    let err = h.run(vec![expr_stmt(out_of_range)]).unwrap_err();
    assert_eq!(err.to_string(), "slice bounds out of range");
}

#[test]
fn ranges_expand_to_integer_arrays() {
    let h = Harness::new();
    let range = Expression::Range(Box::new(RangeExpression {
        token: t(),
        start: int(2),
        end: int(6),
        step: None,
    }));
    assert_eq!(h.run(vec![expr_stmt(range)]).unwrap().inspect(), "[2, 3, 4, 5]");

    let stepped = Expression::Range(Box::new(RangeExpression {
        token: t(),
        start: int(6),
        end: int(0),
        step: Some(int(-2)),
    }));
    assert_eq!(h.run(vec![expr_stmt(stepped)]).unwrap().inspect(), "[6, 4, 2]");
}

#[test]
fn placeholders_build_partials_that_fill_left_to_right() {
    let h = Harness::new();
    h.run(vec![
        let_stmt(
            "sub",
            lambda(
                vec![ident_pat("a"), ident_pat("b")],
                infix(InfixOp::Sub, ident("a"), ident("b")),
            ),
        ),
        let_stmt(
            "minus_one",
            call(ident("sub"), vec![Expression::Placeholder(t()), int(1)]),
        ),
        log_of(call(ident("minus_one"), vec![int(10)])),
    ])
    .unwrap();
    assert_eq!(h.output(), "9\n");
}

#[test]
fn exit_bypasses_recover() {
    let h = Harness::new();
    let err = h
        .run(vec![expr_stmt(recover(
            call(ident("exit"), vec![int(3)]),
            string("caught"),
        ))])
        .unwrap_err();
    match err {
        Error::Exit(e) => assert_eq!(e.code, 3),
        other => panic!("expected exit, got {other:?}"),
    }
}

#[test]
fn then_chains_through_the_builtin() {
    let h = Harness::new();
    h.run(vec![
        let_stmt("task", spawn(int(21))),
        let_stmt(
            "doubled",
            call(
                ident("then"),
                vec![
                    ident("task"),
                    lambda(vec![ident_pat("v")], infix(InfixOp::Mul, ident("v"), int(2))),
                ],
            ),
        ),
        log_of(await_expr(ident("doubled"))),
    ])
    .unwrap();
    assert_eq!(h.output(), "42\n");
}

#[test]
fn await_returns_the_same_value_every_time() {
    let h = Harness::new();
    h.run(vec![let_stmt("task", spawn(int(5)))]).unwrap();
    for _ in 0..3 {
        let value = h.run(vec![expr_stmt(await_expr(ident("task")))]).unwrap();
        assert!(matches!(value, Value::Integer(5)));
    }
}

#[test]
fn observed_failure_stays_local() {
    let h = Harness::new();
    // The await registers observation before the body fails, so the error
    // flows to the awaiting task instead of latching the fatal slot.
    let err = h
        .run(vec![
            let_stmt(
                "task",
                spawn(block(vec![
                    expr_stmt(call(ident("sleep"), vec![int(50)])),
                    expr_stmt(infix(InfixOp::Rem, int(1), int(0))),
                ])),
            ),
            expr_stmt(await_expr(ident("task"))),
        ])
        .unwrap_err();
    assert_eq!(err.to_string(), "division by zero");
    assert!(h.evaluator.check_unhandled_task_failures().is_none());
}

#[test]
fn str_of_string_is_identity_and_array_plus_copies() {
    let h = Harness::new();
    let value = h
        .run(vec![expr_stmt(call(ident("str"), vec![string("plain")]))])
        .unwrap();
    assert!(matches!(value, Value::String(s) if s == "plain"));

    h.run(vec![
        let_stmt("a", array(vec![int(1)])),
        let_stmt("b", infix(InfixOp::Add, ident("a"), array(vec![int(2)]))),
        log_of(ident("a")),
        log_of(ident("b")),
    ])
    .unwrap();
    assert_eq!(h.output(), "[1]\n[1, 2]\n");
}

#[test]
fn member_writes_update_objects_and_indexes_update_arrays() {
    let h = Harness::new();
    h.run(vec![
        let_stmt(
            "obj",
            Expression::Object(ObjectLiteral {
                token: t(),
                pairs: vec![("count".to_string(), int(1))],
            }),
        ),
        expr_stmt(assign(
            AssignOp::AddAssign,
            member(ident("obj"), "count"),
            int(4),
        )),
        log_of(member(ident("obj"), "count")),
        let_stmt("xs", array(vec![int(9), int(8)])),
        expr_stmt(assign(
            AssignOp::Assign,
            Expression::Index(Box::new(IndexExpression {
                token: t(),
                left: ident("xs"),
                index: int(1),
            })),
            int(7),
        )),
        log_of(ident("xs")),
    ])
    .unwrap();
    assert_eq!(h.output(), "5\n[9, 7]\n");
}
