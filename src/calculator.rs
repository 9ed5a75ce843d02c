//! Safe arithmetic / trigonometry expression evaluator.
//!
//! A small recursive-descent parser over `f64`. There are no variables,
//! no assignment and no way to reach anything but the whitelisted
//! functions below, so model-authored expressions are safe to evaluate.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/' | '%') unary)*
//! unary   := ('-' | '+') unary | power
//! power   := postfix (('^' | '**') unary)?      right-associative
//! postfix := primary '!'*
//! primary := number | constant | call | '(' expr ')'
//! call    := name '(' expr (',' expr)* ')'
//! ```
//!
//! A `math.` qualifier in front of a name is accepted and ignored, so
//! `math.sqrt(16)` and `sqrt(16)` are the same expression.

use thiserror::Error;

/// Deepest nesting of parentheses, calls, signs and exponents accepted.
const MAX_DEPTH: usize = 200;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalcError {
    #[error("syntax error at position {pos}: {message}")]
    Syntax { pos: usize, message: String },
    #[error("unknown name '{0}'")]
    UnknownName(String),
    #[error("{0}() takes {1} argument(s), got {2}")]
    Arity(String, usize, usize),
    #[error("math domain error in {0}")]
    Domain(String),
    #[error("division by zero")]
    DivisionByZero,
}

/// Evaluate `expression` to a number.
pub fn evaluate(expression: &str) -> Result<f64, CalcError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if let Some((pos, tok)) = parser.tokens.get(parser.pos) {
        return Err(CalcError::Syntax {
            pos: *pos,
            message: format!("unexpected '{}'", tok),
        });
    }
    if value.is_nan() {
        return Err(CalcError::Domain("expression".to_string()));
    }
    Ok(value)
}

/// Render a result the way a person would write it: integers without a
/// trailing `.0`, everything else with up to 12 significant decimals.
pub fn format_number(value: f64) -> String {
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let s = format!("{:.12}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Ident(String),
    Op(char),
    Pow,
    LParen,
    RParen,
    Comma,
}

impl std::fmt::Display for Tok {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tok::Num(n) => write!(f, "{}", n),
            Tok::Ident(s) => write!(f, "{}", s),
            Tok::Op(c) => write!(f, "{}", c),
            Tok::Pow => write!(f, "**"),
            Tok::LParen => write!(f, "("),
            Tok::RParen => write!(f, ")"),
            Tok::Comma => write!(f, ","),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Tok)>, CalcError> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Scientific notation: 1e-3, 2.5E10
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| CalcError::Syntax {
                    pos: start,
                    message: format!("bad number '{}'", text),
                })?;
                out.push((start, Tok::Num(n)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let name = raw.strip_prefix("math.").unwrap_or(&raw).to_lowercase();
                out.push((start, Tok::Ident(name)));
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                out.push((i, Tok::Pow));
                i += 2;
            }
            '^' => {
                out.push((i, Tok::Pow));
                i += 1;
            }
            '+' | '-' | '*' | '/' | '%' | '!' => {
                out.push((i, Tok::Op(c)));
                i += 1;
            }
            '×' => {
                out.push((i, Tok::Op('*')));
                i += 1;
            }
            '÷' => {
                out.push((i, Tok::Op('/')));
                i += 1;
            }
            '(' => {
                out.push((i, Tok::LParen));
                i += 1;
            }
            ')' => {
                out.push((i, Tok::RParen));
                i += 1;
            }
            ',' => {
                out.push((i, Tok::Comma));
                i += 1;
            }
            other => {
                return Err(CalcError::Syntax {
                    pos: i,
                    message: format!("unexpected character '{}'", other),
                })
            }
        }
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<(usize, Tok)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(p, _)| *p)
            .or_else(|| self.tokens.last().map(|(p, _)| p + 1))
            .unwrap_or(0)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok) -> Result<(), CalcError> {
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(CalcError::Syntax {
                pos: self.position(),
                message: format!("expected '{}'", tok),
            })
        }
    }

    fn expr(&mut self) -> Result<f64, CalcError> {
        let mut acc = self.term()?;
        loop {
            if self.eat(&Tok::Op('+')) {
                acc += self.term()?;
            } else if self.eat(&Tok::Op('-')) {
                acc -= self.term()?;
            } else {
                return Ok(acc);
            }
        }
    }

    fn term(&mut self) -> Result<f64, CalcError> {
        let mut acc = self.unary()?;
        loop {
            if self.eat(&Tok::Op('*')) {
                acc *= self.unary()?;
            } else if self.eat(&Tok::Op('/')) {
                let rhs = self.unary()?;
                if rhs == 0.0 {
                    return Err(CalcError::DivisionByZero);
                }
                acc /= rhs;
            } else if self.eat(&Tok::Op('%')) {
                let rhs = self.unary()?;
                if rhs == 0.0 {
                    return Err(CalcError::DivisionByZero);
                }
                // Floored modulo: result takes the sign of the divisor.
                acc -= rhs * (acc / rhs).floor();
            } else {
                return Ok(acc);
            }
        }
    }

    // Every recursive path in the grammar passes through here.
    fn unary(&mut self) -> Result<f64, CalcError> {
        if self.depth >= MAX_DEPTH {
            return Err(CalcError::Syntax {
                pos: self.position(),
                message: format!("expression nested deeper than {} levels", MAX_DEPTH),
            });
        }
        self.depth += 1;
        let value = self.signed();
        self.depth -= 1;
        value
    }

    fn signed(&mut self) -> Result<f64, CalcError> {
        if self.eat(&Tok::Op('-')) {
            return Ok(-self.unary()?);
        }
        if self.eat(&Tok::Op('+')) {
            return self.unary();
        }
        self.power()
    }

    fn power(&mut self) -> Result<f64, CalcError> {
        let base = self.postfix()?;
        if self.eat(&Tok::Pow) {
            let exp = self.unary()?;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<f64, CalcError> {
        let mut value = self.primary()?;
        while self.eat(&Tok::Op('!')) {
            value = factorial(value)?;
        }
        Ok(value)
    }

    fn primary(&mut self) -> Result<f64, CalcError> {
        let pos = self.position();
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        match tok {
            Some(Tok::Num(n)) => {
                self.pos += 1;
                Ok(n)
            }
            Some(Tok::LParen) => {
                self.pos += 1;
                let v = self.expr()?;
                self.expect(Tok::RParen)?;
                Ok(v)
            }
            Some(Tok::Ident(name)) => {
                self.pos += 1;
                if self.eat(&Tok::LParen) {
                    let mut args = vec![self.expr()?];
                    while self.eat(&Tok::Comma) {
                        args.push(self.expr()?);
                    }
                    self.expect(Tok::RParen)?;
                    call(&name, &args)
                } else {
                    constant(&name)
                }
            }
            Some(other) => Err(CalcError::Syntax {
                pos,
                message: format!("unexpected '{}'", other),
            }),
            None => Err(CalcError::Syntax {
                pos,
                message: "unexpected end of expression".to_string(),
            }),
        }
    }
}

fn constant(name: &str) -> Result<f64, CalcError> {
    match name {
        "pi" => Ok(std::f64::consts::PI),
        "e" => Ok(std::f64::consts::E),
        "tau" => Ok(std::f64::consts::TAU),
        "inf" => Ok(f64::INFINITY),
        _ => Err(CalcError::UnknownName(name.to_string())),
    }
}

fn arity(name: &str, args: &[f64], n: usize) -> Result<(), CalcError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(CalcError::Arity(name.to_string(), n, args.len()))
    }
}

fn domain(name: &str, ok: bool, value: f64) -> Result<f64, CalcError> {
    if ok {
        Ok(value)
    } else {
        Err(CalcError::Domain(name.to_string()))
    }
}

fn call(name: &str, args: &[f64]) -> Result<f64, CalcError> {
    match name {
        "pow" | "atan2" | "hypot" => {
            arity(name, args, 2)?;
            let (a, b) = (args[0], args[1]);
            Ok(match name {
                "pow" => a.powf(b),
                "atan2" => a.atan2(b),
                _ => a.hypot(b),
            })
        }
        "log" => match args {
            [x] => domain(name, *x > 0.0, x.ln()),
            [x, base] => domain(
                name,
                *x > 0.0 && *base > 0.0 && *base != 1.0,
                x.ln() / base.ln(),
            ),
            _ => Err(CalcError::Arity(name.to_string(), 1, args.len())),
        },
        _ => {
            arity(name, args, 1)?;
            let x = args[0];
            match name {
                "sqrt" => domain(name, x >= 0.0, x.sqrt()),
                "cbrt" => Ok(x.cbrt()),
                "abs" | "fabs" => Ok(x.abs()),
                "exp" => Ok(x.exp()),
                "ln" => domain(name, x > 0.0, x.ln()),
                "log10" => domain(name, x > 0.0, x.log10()),
                "log2" => domain(name, x > 0.0, x.log2()),
                "sin" => Ok(x.sin()),
                "cos" => Ok(x.cos()),
                "tan" => Ok(x.tan()),
                "asin" => domain(name, (-1.0..=1.0).contains(&x), x.asin()),
                "acos" => domain(name, (-1.0..=1.0).contains(&x), x.acos()),
                "atan" => Ok(x.atan()),
                "sinh" => Ok(x.sinh()),
                "cosh" => Ok(x.cosh()),
                "tanh" => Ok(x.tanh()),
                "floor" => Ok(x.floor()),
                "ceil" => Ok(x.ceil()),
                "round" => Ok(x.round()),
                "factorial" => factorial(x),
                "degrees" => Ok(x.to_degrees()),
                "radians" => Ok(x.to_radians()),
                _ => Err(CalcError::UnknownName(name.to_string())),
            }
        }
    }
}

fn factorial(x: f64) -> Result<f64, CalcError> {
    if x < 0.0 || x.fract() != 0.0 || x > 170.0 {
        return Err(CalcError::Domain("factorial".to_string()));
    }
    Ok((1..=x as u64).fold(1.0, |acc, k| acc * k as f64))
}
