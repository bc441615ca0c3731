// ABOUTME: Filter expression compiler for the log command
// ABOUTME: Parses comparisons joined by boolean operators into a reusable predicate tree

use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Invalid filter expression at '{0}'")]
    Parse(String),

    #[error("Unbalanced parenthesis in filter expression")]
    Unbalanced,

    #[error("Invalid regex in filter: {0}")]
    Regex(#[from] regex::Error),
}

type Result<T> = std::result::Result<T, FilterError>;

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
}

#[derive(Debug)]
enum Expr {
    Cmp { field: String, op: Op, literal: String },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// A compiled `-F` predicate. Field values come from a caller-supplied
/// lookup so expensive keys (stdout, env, ...) are only fetched when the
/// expression references them.
#[derive(Debug)]
pub struct Filter {
    root: Expr,
}

impl Filter {
    pub fn compile(expression: &str) -> Result<Self> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(FilterError::Parse(parser.rest()));
        }
        Ok(Self { root })
    }

    pub fn matches<F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        eval(&self.root, lookup)
    }
}

fn eval<F>(expr: &Expr, lookup: &F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match expr {
        Expr::And(a, b) => eval(a, lookup) && eval(b, lookup),
        Expr::Or(a, b) => eval(a, lookup) || eval(b, lookup),
        Expr::Cmp { field, op, literal } => {
            let Some(value) = lookup(field) else {
                return false;
            };
            compare(&value, op, literal)
        }
    }
}

fn compare(value: &str, op: &Op, literal: &str) -> bool {
    if let Op::Match = op {
        return Regex::new(literal)
            .map(|re| re.is_match(value))
            .unwrap_or(false);
    }
    // Numbers compare numerically when both sides parse.
    if let (Ok(a), Ok(b)) = (value.parse::<f64>(), literal.parse::<f64>()) {
        return match op {
            Op::Eq => a == b,
            Op::Ne => a != b,
            Op::Lt => a < b,
            Op::Le => a <= b,
            Op::Gt => a > b,
            Op::Ge => a >= b,
            Op::Match => unreachable!(),
        };
    }
    match op {
        Op::Eq => value == literal,
        Op::Ne => value != literal,
        Op::Lt => value < literal,
        Op::Le => value <= literal,
        Op::Gt => value > literal,
        Op::Ge => value >= literal,
        Op::Match => unreachable!(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(String),
    Op(Op),
    And,
    Or,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(Op::Eq));
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'~') => {
                tokens.push(Token::Op(Op::Match));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(Op::Ne));
                i += 2;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(Op::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(Op::Lt));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(Op::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(Op::Gt));
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    literal.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(FilterError::Parse(format!("unterminated {}", quote)));
                }
                i += 1;
                tokens.push(Token::Literal(literal));
            }
            _ if c.is_ascii_alphanumeric() || c == '_' || c == '%' || c == '.' || c == '-' || c == '/' => {
                let mut word = String::new();
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric()
                        || matches!(chars[i], '_' | '%' | '.' | '-' | '/'))
                {
                    word.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Ident(word));
            }
            other => return Err(FilterError::Parse(other.to_string())),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn rest(&self) -> String {
        format!("{:?}", &self.tokens[self.pos.min(self.tokens.len())..])
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_cmp()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(FilterError::Unbalanced),
                }
            }
            Some(Token::Ident(field)) => {
                let field = field.clone();
                let op = match self.next() {
                    Some(Token::Op(op)) => op.clone(),
                    other => return Err(FilterError::Parse(format!("{:?}", other))),
                };
                let literal = match self.next() {
                    Some(Token::Ident(lit)) | Some(Token::Literal(lit)) => lit.clone(),
                    other => return Err(FilterError::Parse(format!("{:?}", other))),
                };
                if let Op::Match = op {
                    // Compile eagerly so bad patterns fail at compile time.
                    Regex::new(&literal)?;
                }
                Ok(Expr::Cmp { field, op, literal })
            }
            other => Err(FilterError::Parse(format!("{:?}", other))),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_numeric_comparison() {
        let filter = Filter::compile("exit == 0").unwrap();
        assert!(filter.matches(&lookup_from(&[("exit", "0")])));
        assert!(!filter.matches(&lookup_from(&[("exit", "1")])));
    }

    #[test]
    fn test_string_comparison() {
        let filter = Filter::compile("process == 'align'").unwrap();
        assert!(filter.matches(&lookup_from(&[("process", "align")])));
        assert!(!filter.matches(&lookup_from(&[("process", "sort")])));
    }

    #[test]
    fn test_boolean_combinators() {
        let filter = Filter::compile("exit == 0 && process != sort").unwrap();
        assert!(filter.matches(&lookup_from(&[("exit", "0"), ("process", "align")])));
        assert!(!filter.matches(&lookup_from(&[("exit", "0"), ("process", "sort")])));

        let either = Filter::compile("exit == 1 || exit == 2").unwrap();
        assert!(either.matches(&lookup_from(&[("exit", "2")])));
        assert!(!either.matches(&lookup_from(&[("exit", "0")])));
    }

    #[test]
    fn test_parentheses() {
        let filter = Filter::compile("(exit == 0 || exit == 1) && process == align").unwrap();
        assert!(filter.matches(&lookup_from(&[("exit", "1"), ("process", "align")])));
        assert!(!filter.matches(&lookup_from(&[("exit", "1"), ("process", "sort")])));
    }

    #[test]
    fn test_regex_match() {
        let filter = Filter::compile("name =~ 'align.*'").unwrap();
        assert!(filter.matches(&lookup_from(&[("name", "align (1)")])));
        assert!(!filter.matches(&lookup_from(&[("name", "sort (1)")])));
    }

    #[test]
    fn test_missing_field_is_false() {
        let filter = Filter::compile("vmem > 100").unwrap();
        assert!(!filter.matches(&lookup_from(&[])));
    }

    #[test]
    fn test_bad_expressions_rejected() {
        assert!(Filter::compile("exit ==").is_err());
        assert!(Filter::compile("(exit == 0").is_err());
        assert!(Filter::compile("name =~ '['").is_err());
    }

    #[test]
    fn test_numeric_ordering() {
        let filter = Filter::compile("realtime >= 1000").unwrap();
        assert!(filter.matches(&lookup_from(&[("realtime", "1500")])));
        // String compare would pass "500" >= "1000"; numeric must not.
        assert!(!filter.matches(&lookup_from(&[("realtime", "500")])));
    }
}
