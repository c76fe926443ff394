//! The expression AST produced by the parser. Every node carries the byte span of
//! its source region so compilation errors can underline the offending part.

use crate::error::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Neg,
}

impl std::fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnaryOp::Plus => write!(f, "+"),
            UnaryOp::Neg => write!(f, "-"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryOp::Add => write!(f, "+"),
            BinaryOp::Sub => write!(f, "-"),
            BinaryOp::Mul => write!(f, "*"),
            BinaryOp::Div => write!(f, "/"),
            BinaryOp::Pow => write!(f, "**"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ast {
    pub node: AstNode,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AstNode {
    Integer(i64),
    Float(f64),
    /// A number with a unit suffix, e.g. `10 MHz`.
    Quantity { magnitude: f64, unit: String },
    Identifier(String),
    Unary {
        op: UnaryOp,
        operand: Box<Ast>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Ast>,
        rhs: Box<Ast>,
    },
    Call {
        function: String,
        args: Vec<Ast>,
    },
}

/// An expression is time-dependent iff the reserved identifier `t` occurs in it.
pub fn is_time_dependent(ast: &Ast) -> bool {
    match &ast.node {
        AstNode::Integer(_) | AstNode::Float(_) | AstNode::Quantity { .. } => false,
        AstNode::Identifier(name) => name == "t",
        AstNode::Unary { operand, .. } => is_time_dependent(operand),
        AstNode::Binary { lhs, rhs, .. } => is_time_dependent(lhs) || is_time_dependent(rhs),
        AstNode::Call { args, .. } => args.iter().any(is_time_dependent),
    }
}
