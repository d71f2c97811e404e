//! AST consumed by the runtime. The parser collaborator produces these nodes;
//! the evaluator only walks them. Every node carries the token it started at
//! so runtime errors can point back into the source.

use crate::language::token::Token;

#[derive(Clone, Debug, Default)]
pub struct Program {
    pub statements: Vec<Statement>,
}

#[derive(Clone, Debug)]
pub enum Statement {
    Let(LetStatement),
    Expression(ExpressionStatement),
}

#[derive(Clone, Debug)]
pub struct LetStatement {
    pub token: Token,
    pub pattern: Pattern,
    pub value: Expression,
}

#[derive(Clone, Debug)]
pub struct ExpressionStatement {
    pub token: Token,
    pub expression: Expression,
}

#[derive(Clone, Debug)]
pub enum Expression {
    Identifier(Identifier),
    Placeholder(Token),
    Integer(IntegerLiteral),
    Float(FloatLiteral),
    Boolean(BooleanLiteral),
    Str(StringLiteral),
    Char(CharLiteral),
    Null(Token),
    Unit(Token),
    Array(ArrayLiteral),
    Object(ObjectLiteral),
    Prefix(Box<PrefixExpression>),
    Infix(Box<InfixExpression>),
    Assign(Box<AssignExpression>),
    Postfix(Box<PostfixExpression>),
    If(Box<IfExpression>),
    Block(BlockExpression),
    For(Box<ForExpression>),
    Match(Box<MatchExpression>),
    Lambda(Box<LambdaExpression>),
    Call(Box<CallExpression>),
    Member(Box<MemberExpression>),
    Index(Box<IndexExpression>),
    Slice(Box<SliceExpression>),
    Range(Box<RangeExpression>),
    Query(Box<QueryExpression>),
    Spawn(Box<SpawnExpression>),
    Await(Box<AwaitExpression>),
    Race(RaceExpression),
    Break(Box<BreakExpression>),
    Continue(Token),
    Recover(Box<RecoverExpression>),
    Import(Box<ImportExpression>),
}

#[derive(Clone, Debug)]
pub struct Identifier {
    pub token: Token,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct IntegerLiteral {
    pub token: Token,
    pub value: i64,
}

#[derive(Clone, Debug)]
pub struct FloatLiteral {
    pub token: Token,
    pub value: f64,
}

#[derive(Clone, Debug)]
pub struct BooleanLiteral {
    pub token: Token,
    pub value: bool,
}

#[derive(Clone, Debug)]
pub struct StringLiteral {
    pub token: Token,
    pub value: String,
}

/// A single rune. Stored as text so multi-byte runes keep their spelling.
#[derive(Clone, Debug)]
pub struct CharLiteral {
    pub token: Token,
    pub value: String,
}

#[derive(Clone, Debug)]
pub struct ArrayLiteral {
    pub token: Token,
    pub elements: Vec<Expression>,
}

#[derive(Clone, Debug)]
pub struct ObjectLiteral {
    pub token: Token,
    pub pairs: Vec<(String, Expression)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrefixOp {
    Neg,
    Not,
}

#[derive(Clone, Debug)]
pub struct PrefixExpression {
    pub token: Token,
    pub operator: PrefixOp,
    pub right: Expression,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfixOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Eq,
    NotEq,
    Eqv,
    And,
    Or,
}

#[derive(Clone, Debug)]
pub struct InfixExpression {
    pub token: Token,
    pub operator: InfixOp,
    pub left: Expression,
    pub right: Expression,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    RemAssign,
}

#[derive(Clone, Debug)]
pub struct AssignExpression {
    pub token: Token,
    pub operator: AssignOp,
    pub target: Expression,
    pub value: Expression,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostfixOp {
    Increment,
    Decrement,
}

#[derive(Clone, Debug)]
pub struct PostfixExpression {
    pub token: Token,
    pub operator: PostfixOp,
    pub target: Expression,
}

#[derive(Clone, Debug)]
pub struct IfExpression {
    pub token: Token,
    pub condition: Expression,
    pub consequence: Expression,
    pub alternative: Option<Expression>,
}

#[derive(Clone, Debug)]
pub struct BlockExpression {
    pub token: Token,
    pub statements: Vec<Statement>,
}

#[derive(Clone, Debug)]
pub struct ForBinding {
    pub pattern: Pattern,
    pub value: Expression,
}

/// C-style loop: bindings run once in the loop scope, the condition gates each
/// iteration, the optional update clause runs after every iteration (also
/// after `continue`, not after `break`), and the optional `then` tail is the
/// loop's value when no `break` carried one.
#[derive(Clone, Debug)]
pub struct ForExpression {
    pub token: Token,
    pub bindings: Vec<ForBinding>,
    pub condition: Expression,
    pub update: Option<Expression>,
    pub body: Expression,
    pub then: Option<Expression>,
}

#[derive(Clone, Debug)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub guard: Option<Expression>,
    pub body: Expression,
}

#[derive(Clone, Debug)]
pub struct MatchExpression {
    pub token: Token,
    pub value: Expression,
    pub arms: Vec<MatchArm>,
}

#[derive(Clone, Debug)]
pub struct LambdaExpression {
    pub token: Token,
    pub parameters: Vec<Pattern>,
    pub body: Expression,
}

#[derive(Clone, Debug)]
pub struct CallExpression {
    pub token: Token,
    pub function: Expression,
    pub arguments: Vec<Expression>,
}

#[derive(Clone, Debug)]
pub struct MemberExpression {
    pub token: Token,
    pub object: Expression,
    pub property: Identifier,
}

#[derive(Clone, Debug)]
pub struct IndexExpression {
    pub token: Token,
    pub left: Expression,
    pub index: Expression,
}

#[derive(Clone, Debug)]
pub struct SliceExpression {
    pub token: Token,
    pub left: Expression,
    pub start: Option<Expression>,
    pub end: Option<Expression>,
}

#[derive(Clone, Debug)]
pub struct RangeExpression {
    pub token: Token,
    pub start: Expression,
    pub end: Expression,
    pub step: Option<Expression>,
}

#[derive(Clone, Debug)]
pub struct QueryExpression {
    pub token: Token,
    pub var: Identifier,
    pub source: Expression,
    pub wheres: Vec<Expression>,
    pub order_by: Option<Expression>,
    pub select: Expression,
}

#[derive(Clone, Debug)]
pub struct SpawnExpression {
    pub token: Token,
    pub body: Expression,
}

#[derive(Clone, Debug)]
pub struct AwaitExpression {
    pub token: Token,
    pub value: Expression,
}

#[derive(Clone, Debug)]
pub struct RaceExpression {
    pub token: Token,
    pub tasks: Vec<Expression>,
}

#[derive(Clone, Debug)]
pub struct BreakExpression {
    pub token: Token,
    pub value: Option<Expression>,
}

#[derive(Clone, Debug)]
pub struct RecoverExpression {
    pub token: Token,
    pub target: Expression,
    pub fallback: Expression,
}

#[derive(Clone, Debug)]
pub struct ImportExpression {
    pub token: Token,
    pub path: StringLiteral,
}

#[derive(Clone, Debug)]
pub enum Pattern {
    Wildcard(Token),
    Identifier(Identifier),
    Integer(IntegerLiteral),
    Float(FloatLiteral),
    Boolean(BooleanLiteral),
    Str(StringLiteral),
    Char(CharLiteral),
    Null(Token),
    Array(ArrayPattern),
}

#[derive(Clone, Debug)]
pub struct ArrayPattern {
    pub token: Token,
    pub elements: Vec<Pattern>,
}

impl Expression {
    /// Token of the node, used to attach source positions to runtime errors.
    pub fn token(&self) -> &Token {
        match self {
            Expression::Identifier(n) => &n.token,
            Expression::Placeholder(t) => t,
            Expression::Integer(n) => &n.token,
            Expression::Float(n) => &n.token,
            Expression::Boolean(n) => &n.token,
            Expression::Str(n) => &n.token,
            Expression::Char(n) => &n.token,
            Expression::Null(t) => t,
            Expression::Unit(t) => t,
            Expression::Array(n) => &n.token,
            Expression::Object(n) => &n.token,
            Expression::Prefix(n) => &n.token,
            Expression::Infix(n) => &n.token,
            Expression::Assign(n) => &n.token,
            Expression::Postfix(n) => &n.token,
            Expression::If(n) => &n.token,
            Expression::Block(n) => &n.token,
            Expression::For(n) => &n.token,
            Expression::Match(n) => &n.token,
            Expression::Lambda(n) => &n.token,
            Expression::Call(n) => &n.token,
            Expression::Member(n) => &n.token,
            Expression::Index(n) => &n.token,
            Expression::Slice(n) => &n.token,
            Expression::Range(n) => &n.token,
            Expression::Query(n) => &n.token,
            Expression::Spawn(n) => &n.token,
            Expression::Await(n) => &n.token,
            Expression::Race(n) => &n.token,
            Expression::Break(n) => &n.token,
            Expression::Continue(t) => t,
            Expression::Recover(n) => &n.token,
            Expression::Import(n) => &n.token,
        }
    }
}

impl Statement {
    pub fn token(&self) -> &Token {
        match self {
            Statement::Let(s) => &s.token,
            Statement::Expression(s) => &s.token,
        }
    }
}
