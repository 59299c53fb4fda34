// dim.rs — Argument dimensions
//
// A dimension is either a compile-time constant or a symbolic expression
// over identifiers (`NPDE`, `nvar*2`, `hyd%ncomp`). Expressions are parsed
// with chumsky combinators and constant sub-expressions are folded, so
// `1*1` is the constant 1.
//
// Preconditions: none.
// Postconditions: `Dim::parse` returns `Fixed` whenever the expression
//                 contains no identifiers.
// Failure modes: malformed text, integer overflow and constant expressions
//                that fold below zero produce `DimParseError`.
// Side effects: none.

use std::fmt;

use chumsky::prelude::*;
use serde::{Deserialize, Serialize};

// ── Expression tree ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DimExpr {
    Const(u32),
    Symbol(String),
    Binary(BinOp, Box<DimExpr>, Box<DimExpr>),
}

impl DimExpr {
    /// Evaluate if the expression contains no symbols.
    pub fn eval(&self) -> Option<u64> {
        match self {
            DimExpr::Const(n) => Some(u64::from(*n)),
            DimExpr::Symbol(_) => None,
            DimExpr::Binary(op, l, r) => {
                let (l, r) = (l.eval()?, r.eval()?);
                match op {
                    BinOp::Add => l.checked_add(r),
                    BinOp::Sub => l.checked_sub(r),
                    BinOp::Mul => l.checked_mul(r),
                }
            }
        }
    }

    /// Identifiers referenced, in order of appearance.
    pub fn symbols(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            DimExpr::Const(_) => {}
            DimExpr::Symbol(s) => out.push(s),
            DimExpr::Binary(_, l, r) => {
                l.collect_symbols(out);
                r.collect_symbols(out);
            }
        }
    }

    /// Replace every constant-valued subtree by its value.
    fn fold(self) -> DimExpr {
        match self {
            DimExpr::Binary(op, l, r) => {
                let folded = DimExpr::Binary(op, Box::new(l.fold()), Box::new(r.fold()));
                match folded.eval().and_then(|v| u32::try_from(v).ok()) {
                    Some(v) => DimExpr::Const(v),
                    None => folded,
                }
            }
            other => other,
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            DimExpr::Binary(BinOp::Add | BinOp::Sub, _, _) => 1,
            DimExpr::Binary(BinOp::Mul, _, _) => 2,
            _ => 3,
        }
    }
}

impl fmt::Display for DimExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimExpr::Const(n) => write!(f, "{}", n),
            DimExpr::Symbol(s) => write!(f, "{}", s),
            DimExpr::Binary(op, l, r) => {
                let prec = self.precedence();
                let sym = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                };
                if l.precedence() < prec {
                    write!(f, "({})", l)?;
                } else {
                    write!(f, "{}", l)?;
                }
                write!(f, "{}", sym)?;
                // Right operand of `-` needs parentheses at equal precedence too.
                if r.precedence() < prec || (r.precedence() == prec && *op == BinOp::Sub) {
                    write!(f, "({})", r)
                } else {
                    write!(f, "{}", r)
                }
            }
        }
    }
}

// ── Dimension ──────────────────────────────────────────────────────────────

/// Number of components per set element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DimRepr", into = "DimRepr")]
pub enum Dim {
    Fixed(u32),
    Symbolic(DimExpr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimParseError(pub String);

impl fmt::Display for DimParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Dim {
    pub fn parse(text: &str) -> Result<Dim, DimParseError> {
        let expr = dim_parser()
            .parse(text)
            .into_result()
            .map_err(|errs| {
                let msgs: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
                DimParseError(format!("invalid dimension '{}': {}", text, msgs.join("; ")))
            })?;
        match expr.fold() {
            DimExpr::Const(n) => Ok(Dim::Fixed(n)),
            expr if expr.symbols().is_empty() => Err(DimParseError(format!(
                "invalid dimension '{}': constant value is negative or out of range",
                text
            ))),
            expr => Ok(Dim::Symbolic(expr)),
        }
    }

    pub fn fixed(&self) -> Option<u32> {
        match self {
            Dim::Fixed(n) => Some(*n),
            Dim::Symbolic(_) => None,
        }
    }

    /// Exactly one component, known at generation time.
    pub fn is_scalar(&self) -> bool {
        self.fixed() == Some(1)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(n) => write!(f, "{}", n),
            Dim::Symbolic(e) => write!(f, "{}", e),
        }
    }
}

/// Serialized form: a bare number or an expression string.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum DimRepr {
    Number(u32),
    Text(String),
}

impl TryFrom<DimRepr> for Dim {
    type Error = DimParseError;

    fn try_from(repr: DimRepr) -> Result<Self, Self::Error> {
        match repr {
            DimRepr::Number(n) => Ok(Dim::Fixed(n)),
            DimRepr::Text(s) => Dim::parse(&s),
        }
    }
}

impl From<Dim> for DimRepr {
    fn from(dim: Dim) -> Self {
        match dim {
            Dim::Fixed(n) => DimRepr::Number(n),
            Dim::Symbolic(e) => DimRepr::Text(e.to_string()),
        }
    }
}

// ── Parser ─────────────────────────────────────────────────────────────────

fn dim_parser<'src>() -> impl Parser<'src, &'src str, DimExpr, extra::Err<Rich<'src, char>>> {
    recursive(|expr| {
        let int = text::int(10).try_map(|s: &str, span| {
            s.parse::<u32>()
                .map(DimExpr::Const)
                .map_err(|e| Rich::custom(span, e))
        });

        // Derived-type components (`hyd%npde`) are one symbol.
        let symbol = text::ascii::ident()
            .then(just('%').then(text::ascii::ident()).repeated())
            .to_slice()
            .map(|s: &str| DimExpr::Symbol(s.to_string()));

        let atom = int
            .or(symbol)
            .or(expr.delimited_by(just('('), just(')')))
            .padded();

        let product = atom.clone().foldl(
            just('*').to(BinOp::Mul).then(atom).repeated(),
            |l, (op, r)| DimExpr::Binary(op, Box::new(l), Box::new(r)),
        );

        product.clone().foldl(
            choice((just('+').to(BinOp::Add), just('-').to(BinOp::Sub)))
                .then(product)
                .repeated(),
            |l, (op, r)| DimExpr::Binary(op, Box::new(l), Box::new(r)),
        )
    })
    .then_ignore(end())
}
