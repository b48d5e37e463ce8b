// Block Script Parser
// Parses tokens into statements and expression trees

use crate::script::lexer::{LexError, Lexer, Token};

use std::fmt;

/// Expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    String(String),

    /// Block variable by name
    Variable(String),

    /// Builtin call: isNumeric(X), max(a, b)
    Call { name: String, args: Vec<Expr> },

    /// Index access: arr[0], obj['key']
    Index { object: Box<Expr>, index: Box<Expr> },

    /// Member access: obj.property
    Member { object: Box<Expr>, property: String },

    Unary { op: UnaryOp, expr: Box<Expr> },

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// condition ? then : else
    Ternary {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },

    Array(Vec<Expr>),

    Object(Vec<(String, Expr)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not, // !
    Neg, // -
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        };
        write!(f, "{}", symbol)
    }
}

/// One `;`-separated statement
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `Name = expr` writes a block variable
    Assign { target: String, value: Expr },

    /// `emit('Event')` publishes an output event
    Emit(Expr),

    /// `terminate('reason')` stops the block gracefully
    Terminate(Expr),

    /// `delay(ms)` suspends the script
    Delay(Expr),

    /// Bare expression; its value becomes the script result. A bare
    /// zero-argument call may name an imported function.
    Expr(Expr),
}

/// A parsed script
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at token {}: {}", self.position, self.message)
    }
}

impl std::error::Error for ParseError {}

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            position: err.position,
        }
    }
}

/// Recursive descent parser
pub struct ScriptParser {
    tokens: Vec<Token>,
    position: usize,
}

impl ScriptParser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// Parse a whole script
    pub fn parse_program(input: &str) -> Result<Program, ParseError> {
        let tokens = Lexer::new(input).tokenize()?;
        let mut parser = Self::new(tokens);
        parser.program()
    }

    /// Parse a single expression
    pub fn parse_expr(input: &str) -> Result<Expr, ParseError> {
        let tokens = Lexer::new(input).tokenize()?;
        let mut parser = Self::new(tokens);
        let expr = parser.parse_ternary()?;
        if !parser.is_at_end() {
            return Err(parser.error(&format!("unexpected token: {}", parser.peek())));
        }
        Ok(expr)
    }

    fn program(&mut self) -> Result<Program, ParseError> {
        let mut statements = Vec::new();

        loop {
            while self.check(&Token::Semicolon) {
                self.advance();
            }
            if self.is_at_end() {
                break;
            }

            statements.push(self.statement()?);

            if !self.is_at_end() {
                self.expect(&Token::Semicolon, "expected ';' between statements")?;
            }
        }

        Ok(Program { statements })
    }

    fn statement(&mut self) -> Result<Statement, ParseError> {
        if let Token::Identifier(name) = self.peek().clone() {
            if self.peek_at(1) == &Token::Assign {
                self.advance();
                self.advance();
                let value = self.parse_ternary()?;
                return Ok(Statement::Assign {
                    target: name,
                    value,
                });
            }
        }

        let expr = self.parse_ternary()?;
        let statement = match expr {
            Expr::Call { name, mut args } if is_intrinsic(&name) => {
                if args.len() != 1 {
                    return Err(self.error(&format!("{}() requires 1 argument", name)));
                }
                let arg = args.remove(0);
                match name.as_str() {
                    "emit" => Statement::Emit(arg),
                    "terminate" => Statement::Terminate(arg),
                    _ => Statement::Delay(arg),
                }
            }
            other => Statement::Expr(other),
        };
        Ok(statement)
    }

    // Precedence (lowest to highest):
    // ternary, ||, &&, == !=, < <= > >=, + -, * / %, unary, postfix

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let condition = self.parse_or()?;

        if self.check(&Token::Question) {
            self.advance();
            let then_expr = self.parse_ternary()?;
            self.expect(&Token::Colon, "expected ':' in ternary expression")?;
            let else_expr = self.parse_ternary()?;

            return Ok(Expr::Ternary {
                condition: Box::new(condition),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            });
        }

        Ok(condition)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(Self::parse_and, |t| match t {
            Token::Or => Some(BinaryOp::Or),
            _ => None,
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(Self::parse_equality, |t| match t {
            Token::And => Some(BinaryOp::And),
            _ => None,
        })
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(Self::parse_comparison, |t| match t {
            Token::Eq => Some(BinaryOp::Eq),
            Token::Ne => Some(BinaryOp::Ne),
            _ => None,
        })
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(Self::parse_additive, |t| match t {
            Token::Lt => Some(BinaryOp::Lt),
            Token::Le => Some(BinaryOp::Le),
            Token::Gt => Some(BinaryOp::Gt),
            Token::Ge => Some(BinaryOp::Ge),
            _ => None,
        })
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(Self::parse_multiplicative, |t| match t {
            Token::Plus => Some(BinaryOp::Add),
            Token::Minus => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(Self::parse_unary, |t| match t {
            Token::Star => Some(BinaryOp::Mul),
            Token::Slash => Some(BinaryOp::Div),
            Token::Percent => Some(BinaryOp::Mod),
            _ => None,
        })
    }

    /// Left-associative chain of one precedence level
    fn binary_level(
        &mut self,
        operand: fn(&mut Self) -> Result<Expr, ParseError>,
        operator: fn(&Token) -> Option<BinaryOp>,
    ) -> Result<Expr, ParseError> {
        let mut left = operand(self)?;

        while let Some(op) = operator(self.peek()) {
            self.advance();
            let right = operand(self)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            Token::Not => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.parse_postfix(),
        };
        self.advance();
        let expr = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;

        loop {
            if self.check(&Token::Dot) {
                self.advance();
                let Token::Identifier(property) = self.advance().clone() else {
                    return Err(self.error("expected property name after '.'"));
                };

                // X.upper() is sugar for upper(X)
                if self.check(&Token::LParen) {
                    let args = self.parse_args()?;
                    expr = Expr::Call {
                        name: property,
                        args: std::iter::once(expr).chain(args).collect(),
                    };
                } else {
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                    };
                }
            } else if self.check(&Token::LBracket) {
                self.advance();
                let index = self.parse_ternary()?;
                self.expect(&Token::RBracket, "expected ']'")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.advance().clone() {
            Token::Null => Ok(Expr::Null),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::String(s) => Ok(Expr::String(s)),
            Token::Identifier(name) => {
                if self.check(&Token::LParen) {
                    let args = self.parse_args()?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Token::LParen => {
                let expr = self.parse_ternary()?;
                self.expect(&Token::RParen, "expected ')'")?;
                Ok(expr)
            }
            Token::LBracket => {
                let items = self.comma_list(&Token::RBracket, Self::parse_ternary)?;
                Ok(Expr::Array(items))
            }
            Token::LBrace => {
                let pairs = self.comma_list(&Token::RBrace, |p| {
                    let key = match p.advance().clone() {
                        Token::Identifier(s) | Token::String(s) => s,
                        _ => return Err(p.error("expected object key")),
                    };
                    p.expect(&Token::Colon, "expected ':' after object key")?;
                    Ok((key, p.parse_ternary()?))
                })?;
                Ok(Expr::Object(pairs))
            }
            token => Err(self.error(&format!("unexpected token: {}", token))),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect(&Token::LParen, "expected '('")?;
        self.comma_list(&Token::RParen, Self::parse_ternary)
    }

    /// Items separated by commas up to `close`, trailing comma allowed.
    /// The opening delimiter has already been consumed.
    fn comma_list<T>(
        &mut self,
        close: &Token,
        mut item: impl FnMut(&mut Self) -> Result<T, ParseError>,
    ) -> Result<Vec<T>, ParseError> {
        let mut items = Vec::new();

        while !self.check(close) {
            items.push(item(self)?);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }

        self.expect(close, &format!("expected '{}'", close))?;
        Ok(items)
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.position + offset)
            .unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> &Token {
        let token = self.tokens.get(self.position).unwrap_or(&Token::Eof);
        self.position += 1;
        token
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(token)
    }

    fn expect(&mut self, token: &Token, msg: &str) -> Result<(), ParseError> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(msg))
        }
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn error(&self, message: &str) -> ParseError {
        ParseError {
            message: message.to_string(),
            position: self.position,
        }
    }
}

fn is_intrinsic(name: &str) -> bool {
    matches!(name, "emit" | "terminate" | "delay")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment_and_result() {
        let program = ScriptParser::parse_program("Result = X + Y; Result").unwrap();
        assert_eq!(program.statements.len(), 2);
        assert!(matches!(
            &program.statements[0],
            Statement::Assign { target, value: Expr::Binary { op: BinaryOp::Add, .. } }
                if target == "Result"
        ));
        assert_eq!(
            program.statements[1],
            Statement::Expr(Expr::Variable("Result".to_string()))
        );
    }

    #[test]
    fn test_parse_intrinsics() {
        let program =
            ScriptParser::parse_program("emit('Done'); delay(100); terminate('stop');").unwrap();
        assert_eq!(
            program.statements,
            vec![
                Statement::Emit(Expr::String("Done".to_string())),
                Statement::Delay(Expr::Number(100.0)),
                Statement::Terminate(Expr::String("stop".to_string())),
            ]
        );
    }

    #[test]
    fn test_intrinsic_arity_checked() {
        let err = ScriptParser::parse_program("emit()").unwrap_err();
        assert!(err.message.contains("emit()"));
    }

    #[test]
    fn test_empty_script() {
        assert!(ScriptParser::parse_program("  ; ;").unwrap().statements.is_empty());
    }

    #[test]
    fn test_missing_separator() {
        let err = ScriptParser::parse_program("A = 1 B = 2").unwrap_err();
        assert!(err.message.contains("';'"));
    }

    #[test]
    fn test_precedence() {
        // && binds tighter than ||
        let expr = ScriptParser::parse_expr("a || b && c").unwrap();
        let Expr::Binary {
            op: BinaryOp::Or,
            right,
            ..
        } = expr
        else {
            panic!("expected or expression");
        };
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::And, .. }));

        // * binds tighter than +
        let expr = ScriptParser::parse_expr("1 + 2 * 3").unwrap();
        let Expr::Binary {
            op: BinaryOp::Add,
            right,
            ..
        } = expr
        else {
            panic!("expected add expression");
        };
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_guard_with_negated_calls() {
        let expr = ScriptParser::parse_expr("!isNumeric(X) || !isNumeric(Y)").unwrap();
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::Or, .. }));
    }

    #[test]
    fn test_method_sugar_and_index() {
        let expr = ScriptParser::parse_expr("Name.upper()").unwrap();
        assert_eq!(
            expr,
            Expr::Call {
                name: "upper".to_string(),
                args: vec![Expr::Variable("Name".to_string())],
            }
        );

        let expr = ScriptParser::parse_expr("Items[0].id").unwrap();
        assert!(matches!(expr, Expr::Member { .. }));
    }

    #[test]
    fn test_collections() {
        let expr = ScriptParser::parse_expr("[1, 2, 3,]").unwrap();
        assert!(matches!(expr, Expr::Array(items) if items.len() == 3));

        let expr = ScriptParser::parse_expr("{ w: 2, 'h': 5 }").unwrap();
        assert!(matches!(expr, Expr::Object(pairs) if pairs.len() == 2));
    }
}
