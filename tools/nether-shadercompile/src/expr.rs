//! Skip expressions
//!
//! A skip expression is a C-style boolean formula over an entry's defines,
//! e.g. `$FOG && ($LIGHTS > 2 || !$SHADOWS)`. Variables are resolved to slot
//! indices while parsing, so evaluation is a walk over the tree with a value
//! slice and no lookups.
//!
//! Binary operators are parsed as a flat `primary (op primary)*` stream and
//! folded with a priority stack. Comparisons bind tightest, then `&&`, then
//! `||`. Operators of equal priority associate to the left.

use thiserror::Error;

/// Deepest nesting of `(`, `!` and `defined` the parser accepts
pub const MAX_NESTING: usize = 256;

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    And,
    Or,
    Eq,
    Neq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl BinOp {
    /// Fold priority: a higher number binds looser
    pub fn priority(self) -> u8 {
        match self {
            BinOp::Eq | BinOp::Neq | BinOp::Gt | BinOp::Ge | BinOp::Lt | BinOp::Le => 0,
            BinOp::And => 1,
            BinOp::Or => 2,
        }
    }

    fn apply(self, lhs: i32, rhs: i32) -> bool {
        match self {
            BinOp::And => lhs != 0 && rhs != 0,
            BinOp::Or => lhs != 0 || rhs != 0,
            BinOp::Eq => lhs == rhs,
            BinOp::Neq => lhs != rhs,
            BinOp::Gt => lhs > rhs,
            BinOp::Ge => lhs >= rhs,
            BinOp::Lt => lhs < rhs,
            BinOp::Le => lhs <= rhs,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::Eq => "==",
            BinOp::Neq => "!=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
        }
    }
}

/// Parsed skip expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Const(i32),
    /// Index into the entry's define list
    Var(usize),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// Expression parse errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected '{found}' at column {pos}")]
    UnexpectedChar { found: char, pos: usize },

    #[error("expected an operator at column {pos}")]
    ExpectedOperator { pos: usize },

    #[error("unclosed '(' opened at column {pos}")]
    UnclosedParen { pos: usize },

    #[error("integer literal '{0}' is out of range")]
    InvalidNumber(String),

    #[error("expression nested too deeply at column {pos}")]
    TooDeep { pos: usize },
}

impl Expr {
    /// The expression that never skips anything
    pub const FALSE: Expr = Expr::Const(0);

    /// Parse `text` against the entry's define names
    ///
    /// Empty text is the constant `false`. Unknown variables read as 0.
    pub fn parse<S: AsRef<str>>(text: &str, names: &[S]) -> Result<Expr, ExprError> {
        if text.trim().is_empty() {
            return Ok(Expr::FALSE);
        }

        let names: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
        let mut parser = Parser {
            src: text.as_bytes(),
            pos: 0,
            depth: 0,
            names: &names,
        };

        let expr = parser.expr()?;
        parser.skip_whitespace();
        match parser.peek() {
            None => Ok(expr),
            Some(c) => Err(ExprError::UnexpectedChar {
                found: c as char,
                pos: parser.pos,
            }),
        }
    }

    /// Parse, falling back to the constant `false` on error
    ///
    /// The error is returned alongside so the caller can report it.
    pub fn parse_lenient<S: AsRef<str>>(text: &str, names: &[S]) -> (Expr, Option<ExprError>) {
        match Expr::parse(text, names) {
            Ok(expr) => (expr, None),
            Err(e) => (Expr::FALSE, Some(e)),
        }
    }

    /// Evaluate against one value per define
    ///
    /// Logical and comparison nodes yield 0 or 1.
    pub fn eval(&self, values: &[i32]) -> i32 {
        match self {
            Expr::Const(value) => *value,
            Expr::Var(slot) => values.get(*slot).copied().unwrap_or(0),
            Expr::Not(inner) => (inner.eval(values) == 0) as i32,
            Expr::Binary { op, lhs, rhs } => op.apply(lhs.eval(values), rhs.eval(values)) as i32,
        }
    }

    /// Whether this is the constant `false`
    pub fn is_never(&self) -> bool {
        matches!(self, Expr::Const(0))
    }

    fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Const(value) => write!(f, "{}", value),
            Expr::Var(slot) => write!(f, "${}", slot),
            Expr::Not(inner) => write!(f, "!{}", inner),
            Expr::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
        }
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    /// Open `primary` calls
    depth: usize,
    names: &'a [&'a str],
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    /// `primary (op primary)*`, folded by priority
    fn expr(&mut self) -> Result<Expr, ExprError> {
        let mut pending: Vec<(Expr, BinOp)> = Vec::new();
        let mut current = self.primary()?;

        loop {
            self.skip_whitespace();
            if matches!(self.peek(), None | Some(b')')) {
                break;
            }

            let op = self.operator()?;
            while pending
                .last()
                .is_some_and(|(_, top)| top.priority() <= op.priority())
            {
                if let Some((lhs, top)) = pending.pop() {
                    current = Expr::binary(top, lhs, current);
                }
            }
            pending.push((current, op));
            current = self.primary()?;
        }

        while let Some((lhs, op)) = pending.pop() {
            current = Expr::binary(op, lhs, current);
        }
        Ok(current)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        if self.depth >= MAX_NESTING {
            return Err(ExprError::TooDeep { pos: self.pos });
        }
        self.depth += 1;
        let result = self.operand();
        self.depth -= 1;
        result
    }

    fn operand(&mut self) -> Result<Expr, ExprError> {
        self.skip_whitespace();
        let start = self.pos;

        match self.peek() {
            None => Err(ExprError::UnexpectedEnd),
            Some(b'(') => {
                self.pos += 1;
                let inner = self.expr()?;
                self.skip_whitespace();
                if self.peek() != Some(b')') {
                    return Err(ExprError::UnclosedParen { pos: start });
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(b'!') => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.primary()?)))
            }
            Some(b'$') => {
                self.pos += 1;
                let name = self.identifier();
                if name.is_empty() {
                    return Err(self.unexpected());
                }
                Ok(self.variable(name))
            }
            Some(b'0'..=b'9') => self.number(),
            Some(b'-') if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => self.number(),
            Some(c) if c.is_ascii_alphabetic() => {
                if self.identifier() == "defined" {
                    // Every define always has a value: plain truthiness
                    let operand = self.primary()?;
                    Ok(Expr::binary(BinOp::Neq, operand, Expr::Const(0)))
                } else {
                    self.pos = start;
                    Err(self.unexpected())
                }
            }
            Some(_) => Err(self.unexpected()),
        }
    }

    fn operator(&mut self) -> Result<BinOp, ExprError> {
        let pair = (self.peek(), self.peek_at(1));
        let (op, len) = match pair {
            (Some(b'&'), Some(b'&')) => (BinOp::And, 2),
            (Some(b'|'), Some(b'|')) => (BinOp::Or, 2),
            (Some(b'='), Some(b'=')) => (BinOp::Eq, 2),
            (Some(b'!'), Some(b'=')) => (BinOp::Neq, 2),
            (Some(b'>'), Some(b'=')) => (BinOp::Ge, 2),
            (Some(b'<'), Some(b'=')) => (BinOp::Le, 2),
            (Some(b'>'), _) => (BinOp::Gt, 1),
            (Some(b'<'), _) => (BinOp::Lt, 1),
            _ => return Err(ExprError::ExpectedOperator { pos: self.pos }),
        };
        self.pos += len;
        Ok(op)
    }

    fn identifier(&mut self) -> &'a str {
        let src = self.src;
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            self.pos += 1;
        }
        // Identifier bytes are ASCII
        std::str::from_utf8(&src[start..self.pos]).unwrap_or_default()
    }

    fn number(&mut self) -> Result<Expr, ExprError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]);
        text.parse::<i32>()
            .map(Expr::Const)
            .map_err(|_| ExprError::InvalidNumber(text.into_owned()))
    }

    fn variable(&self, name: &str) -> Expr {
        match self.names.iter().position(|n| *n == name) {
            Some(slot) => Expr::Var(slot),
            None => {
                tracing::debug!(name, "Unknown variable in skip expression, reading as 0");
                Expr::Const(0)
            }
        }
    }

    fn unexpected(&self) -> ExprError {
        match self.src.get(self.pos) {
            Some(&c) => ExprError::UnexpectedChar {
                found: c as char,
                pos: self.pos,
            },
            None => ExprError::UnexpectedEnd,
        }
    }
}
