//! Formula tokenizer and recursive-descent parser
//!
//! Precedence, lowest first: comparison, `&`, `+ -`, `* / %`, unary `-`.
//!
//! Both the parser's own recursion (parentheses, calls, unary minus) and the
//! height of the resulting tree are capped, since evaluating and dropping the
//! tree recurse as well.

use super::ExpressionError;

/// Deepest allowed nesting of parentheses, calls and unary minus
pub const MAX_NESTING_DEPTH: usize = 128;

/// Tallest allowed expression tree
pub const MAX_TREE_HEIGHT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Text(String),
    Bool(bool),
    /// `{Name}` reference, stored without braces
    Field(String),
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Distinct field references in first-use order
    pub fn field_references(&self) -> Vec<String> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references(&self, refs: &mut Vec<String>) {
        match self {
            Expr::Field(name) => {
                if !refs.contains(name) {
                    refs.push(name.clone());
                }
            }
            Expr::Negate(inner) => inner.collect_references(refs),
            Expr::Binary { left, right, .. } => {
                left.collect_references(refs);
                right.collect_references(refs);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_references(refs);
                }
            }
            Expr::Number(_) | Expr::Text(_) | Expr::Bool(_) => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Text(String),
    Field(String),
    Ident(String),
    Op(BinaryOp),
    Minus,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '0'..='9' | '.' => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::syntax(start, format!("bad number '{}'", text)))?;
                tokens.push((start, Token::Number(n)));
                continue;
            }
            '"' => {
                i += 1;
                let mut text = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(ExpressionError::syntax(start, "unterminated string")),
                        Some('\\') => {
                            if let Some(next) = chars.get(i + 1) {
                                text.push(*next);
                            }
                            i += 2;
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((start, Token::Text(text)));
                continue;
            }
            '{' => {
                i += 1;
                let name_start = i;
                while i < chars.len() && chars[i] != '}' {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ExpressionError::syntax(start, "unterminated field reference"));
                }
                let name: String = chars[name_start..i].iter().collect();
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(ExpressionError::syntax(start, "empty field reference"));
                }
                i += 1;
                tokens.push((start, Token::Field(name)));
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push((start, Token::Ident(ident)));
                continue;
            }
            _ => {}
        }

        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (',', _) => (Token::Comma, 1),
            ('+', _) => (Token::Op(BinaryOp::Add), 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Op(BinaryOp::Mul), 1),
            ('/', _) => (Token::Op(BinaryOp::Div), 1),
            ('%', _) => (Token::Op(BinaryOp::Mod), 1),
            ('&', _) => (Token::Op(BinaryOp::Concat), 1),
            ('=', Some('=')) => (Token::Op(BinaryOp::Eq), 2),
            ('=', _) => (Token::Op(BinaryOp::Eq), 1),
            ('!', Some('=')) => (Token::Op(BinaryOp::Ne), 2),
            ('<', Some('>')) => (Token::Op(BinaryOp::Ne), 2),
            ('<', Some('=')) => (Token::Op(BinaryOp::Le), 2),
            ('<', _) => (Token::Op(BinaryOp::Lt), 1),
            ('>', Some('=')) => (Token::Op(BinaryOp::Ge), 2),
            ('>', _) => (Token::Op(BinaryOp::Gt), 1),
            _ => {
                return Err(ExpressionError::syntax(
                    start,
                    format!("unexpected character '{}'", c),
                ))
            }
        };
        tokens.push((start, token));
        i += width;
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    depth: usize,
    /// Height of the most recently parsed subtree
    height: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        let position = self.position();
        match self.advance() {
            Some(ref t) if *t == expected => Ok(()),
            Some(t) => Err(ExpressionError::syntax(
                position,
                format!("expected {:?}, found {:?}", expected, t),
            )),
            None => Err(ExpressionError::syntax(
                position,
                format!("expected {:?}, found end of input", expected),
            )),
        }
    }

    fn enter(&mut self, position: usize) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ExpressionError::syntax(position, "expression nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn grow(&mut self, position: usize, height: usize) -> Result<(), ExpressionError> {
        if height > MAX_TREE_HEIGHT {
            return Err(ExpressionError::syntax(position, "expression nested too deeply"));
        }
        self.height = height;
        Ok(())
    }

    fn binary_level(
        &mut self,
        ops: &[BinaryOp],
        next: fn(&mut Parser) -> Result<Expr, ExpressionError>,
    ) -> Result<Expr, ExpressionError> {
        let mut left = next(self)?;
        let mut height = self.height;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) if ops.contains(op) => *op,
                Some(Token::Minus) if ops.contains(&BinaryOp::Sub) => BinaryOp::Sub,
                _ => {
                    self.height = height;
                    return Ok(left);
                }
            };
            let position = self.position();
            self.advance();
            let right = next(self)?;
            height = height.max(self.height) + 1;
            self.grow(position, height)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            &[
                BinaryOp::Eq,
                BinaryOp::Ne,
                BinaryOp::Lt,
                BinaryOp::Le,
                BinaryOp::Gt,
                BinaryOp::Ge,
            ],
            Parser::concat,
        )
    }

    fn concat(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&[BinaryOp::Concat], Parser::additive)
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&[BinaryOp::Add, BinaryOp::Sub], Parser::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&[BinaryOp::Mul, BinaryOp::Div, BinaryOp::Mod], Parser::unary)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            let position = self.position();
            self.advance();
            self.enter(position)?;
            let inner = self.unary()?;
            self.leave();
            self.grow(position, self.height + 1)?;
            return Ok(Expr::Negate(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let position = self.position();
        self.height = 1;
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Text(s)) => Ok(Expr::Text(s)),
            Some(Token::Field(name)) => Ok(Expr::Field(name)),
            Some(Token::LParen) => {
                self.enter(position)?;
                let inner = self.comparison()?;
                self.leave();
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(ident)) => {
                let upper = ident.to_ascii_uppercase();
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.advance();
                    self.enter(position)?;
                    let args = self.arguments()?;
                    self.leave();
                    return Ok(Expr::Call { name: upper, args });
                }
                match upper.as_str() {
                    "TRUE" => Ok(Expr::Bool(true)),
                    "FALSE" => Ok(Expr::Bool(false)),
                    _ => Err(ExpressionError::syntax(
                        position,
                        format!("unexpected identifier '{}'", ident),
                    )),
                }
            }
            Some(t) => Err(ExpressionError::syntax(
                position,
                format!("unexpected token {:?}", t),
            )),
            None => Err(ExpressionError::syntax(position, "unexpected end of input")),
        }
    }

    /// Call arguments up to the closing `)`; leaves the call's height
    fn arguments(&mut self) -> Result<Vec<Expr>, ExpressionError> {
        let mut args = Vec::new();
        let mut height = 1;
        if matches!(self.peek(), Some(Token::RParen)) {
            self.advance();
            self.height = height;
            return Ok(args);
        }
        loop {
            let start = self.position();
            args.push(self.comparison()?);
            height = height.max(self.height + 1);
            self.grow(start, height)?;
            let position = self.position();
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                _ => return Err(ExpressionError::syntax(position, "expected ',' or ')'")),
            }
        }
    }
}

/// Parse a formula expression
pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExpressionError::syntax(0, "empty expression"));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.chars().count(),
        depth: 0,
        height: 0,
    };
    let expr = parser.comparison()?;
    if parser.pos < parser.tokens.len() {
        return Err(ExpressionError::syntax(
            parser.position(),
            "unexpected trailing input",
        ));
    }
    Ok(expr)
}
