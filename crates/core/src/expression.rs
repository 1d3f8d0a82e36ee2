use crate::context::{ContextSnapshot, ROOTS};
use serde_json::Value;

/// Deepest list/`coalesce` nesting a condition may use
const MAX_NESTING: usize = 32;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("unterminated reference starting at position {0}")]
    UnterminatedReference(usize),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("invalid reference '{0}'")]
    InvalidReference(String),

    #[error("disallowed construct '{0}'")]
    Disallowed(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected trailing input '{0}'")]
    Trailing(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ref(String),
    Str(String),
    Num(f64),
    Ident(String),
    Eq,
    Ne,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Ref(String),
    Literal(Value),
    List(Vec<Expr>),
    Coalesce(Vec<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    In(Box<Expr>, Box<Expr>),
}

/// Resolve an expression to a value.
///
/// A lone `${path}` keeps the referenced value's type, `coalesce(...)` returns
/// its first non-null operand, text with embedded references is interpolated
/// into a string, and anything else is returned as a literal string.
pub fn resolve(expr: &str, ctx: &ContextSnapshot) -> Value {
    let trimmed = expr.trim();

    if let Some(path) = single_reference(trimmed) {
        return match validate_reference(path) {
            Ok(path) => lookup(&path, ctx),
            Err(e) => {
                tracing::debug!(expr = trimmed, error = %e, "reference resolved to null");
                Value::Null
            }
        };
    }

    if trimmed.starts_with("coalesce(") {
        return match parse(trimmed) {
            Ok(parsed @ Expr::Coalesce(_)) => eval(&parsed, ctx),
            Ok(_) => Value::Null,
            Err(e) => {
                tracing::warn!(expr = trimmed, error = %e, "rejected expression");
                Value::Null
            }
        };
    }

    if expr.contains("${") {
        return Value::String(interpolate(expr, ctx));
    }

    Value::String(expr.to_string())
}

/// Resolve every string leaf of a JSON value
pub fn resolve_value(value: &Value, ctx: &ContextSnapshot) -> Value {
    match value {
        Value::String(s) => resolve(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Evaluate a gating condition. An empty condition is true; a malformed or
/// disallowed one is false.
///
/// Conditions come from workflow text, so the grammar is a closed whitelist:
///
/// ```text
/// condition := operand [ ("==" | "!=" | "in") operand ]
/// operand   := "${" root.path "}" | 'string' | "string" | number
///            | true | false | null | None
///            | "[" operand ("," operand)* "]"
///            | "coalesce(" operand ("," operand)* ")"
/// ```
pub fn evaluate_condition(expr: &str, ctx: &ContextSnapshot) -> bool {
    if expr.trim().is_empty() {
        return true;
    }

    match parse(expr) {
        Ok(parsed) => truthy(&eval(&parsed, ctx)),
        Err(e) => {
            tracing::warn!(expr, error = %e, "condition rejected, evaluating to false");
            false
        }
    }
}

/// Evaluate an optional condition, treating absence as "always run"
pub fn evaluate_optional(expr: Option<&str>, ctx: &ContextSnapshot) -> bool {
    expr.map_or(true, |e| evaluate_condition(e, ctx))
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn single_reference(expr: &str) -> Option<&str> {
    let inner = expr.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains('}') || inner.contains("${") {
        return None;
    }
    Some(inner)
}

fn validate_reference(raw: &str) -> Result<String, ExpressionError> {
    let path = raw.trim();
    let root = path.split('.').next().unwrap_or_default();

    let valid_segment =
        |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if !ROOTS.contains(&root) || !path.split('.').all(valid_segment) {
        return Err(ExpressionError::InvalidReference(path.to_string()));
    }

    Ok(path.to_string())
}

fn lookup(path: &str, ctx: &ContextSnapshot) -> Value {
    ctx.get(path).cloned().unwrap_or(Value::Null)
}

fn interpolate(expr: &str, ctx: &ContextSnapshot) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut rest = expr;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        // `${NAME}` outside the known roots is left for the shell to expand.
        match validate_reference(&after[..end]) {
            Ok(path) => out.push_str(&display(&lookup(&path, ctx))),
            Err(_) => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '$' if chars.get(i + 1) == Some(&'{') => {
                let start = i;
                let close = chars[i + 2..]
                    .iter()
                    .position(|&ch| ch == '}')
                    .ok_or(ExpressionError::UnterminatedReference(start))?;
                let inner: String = chars[i + 2..i + 2 + close].iter().collect();
                tokens.push(Token::Ref(validate_reference(&inner)?));
                i += close + 3;
            }
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExpressionError::UnterminatedString),
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                literal.push(escaped);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            literal.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(literal));
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while chars
                    .get(i)
                    .is_some_and(|ch| ch.is_ascii_digit() || *ch == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::Disallowed(text.clone()))?;
                tokens.push(Token::Num(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(ExpressionError::Disallowed(other.to_string())),
        }
    }

    Ok(tokens)
}

fn parse(input: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.condition()?;

    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(ExpressionError::Trailing(format!("{token:?}"))),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, ExpressionError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ExpressionError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        let token = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(ExpressionError::Disallowed(format!("{token:?}")))
        }
    }

    fn condition(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.operand()?;

        let op = match self.peek() {
            Some(Token::Eq) => Token::Eq,
            Some(Token::Ne) => Token::Ne,
            Some(Token::Ident(word)) if word == "in" => Token::Ident("in".to_string()),
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.operand()?;

        Ok(match op {
            Token::Eq => Expr::Eq(Box::new(left), Box::new(right)),
            Token::Ne => Expr::Ne(Box::new(left), Box::new(right)),
            _ => Expr::In(Box::new(left), Box::new(right)),
        })
    }

    fn operand(&mut self) -> Result<Expr, ExpressionError> {
        match self.next()? {
            Token::Ref(path) => Ok(Expr::Ref(path)),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Num(n) => Ok(Expr::Literal(number(n))),
            Token::LBracket => Ok(Expr::List(self.sequence(Token::RBracket)?)),
            Token::Ident(word) => match word.as_str() {
                "true" | "True" => Ok(Expr::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "None" => Ok(Expr::Literal(Value::Null)),
                "coalesce" => {
                    self.expect(Token::LParen)?;
                    let args = self.sequence(Token::RParen)?;
                    if args.is_empty() {
                        return Err(ExpressionError::Disallowed("coalesce()".to_string()));
                    }
                    Ok(Expr::Coalesce(args))
                }
                other => Err(ExpressionError::Disallowed(other.to_string())),
            },
            other => Err(ExpressionError::Disallowed(format!("{other:?}"))),
        }
    }

    fn sequence(&mut self, close: Token) -> Result<Vec<Expr>, ExpressionError> {
        if self.depth >= MAX_NESTING {
            return Err(ExpressionError::Disallowed(format!(
                "nesting deeper than {MAX_NESTING}"
            )));
        }
        self.depth += 1;
        let items = self.sequence_items(close);
        self.depth -= 1;
        items
    }

    fn sequence_items(&mut self, close: Token) -> Result<Vec<Expr>, ExpressionError> {
        let mut items = Vec::new();
        if self.peek() == Some(&close) {
            self.pos += 1;
            return Ok(items);
        }

        loop {
            items.push(self.operand()?);
            match self.next()? {
                Token::Comma => continue,
                token if token == close => return Ok(items),
                other => return Err(ExpressionError::Disallowed(format!("{other:?}"))),
            }
        }
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn eval(expr: &Expr, ctx: &ContextSnapshot) -> Value {
    match expr {
        Expr::Ref(path) => lookup(path, ctx),
        Expr::Literal(value) => value.clone(),
        Expr::List(items) => Value::Array(items.iter().map(|e| eval(e, ctx)).collect()),
        Expr::Coalesce(args) => args
            .iter()
            .map(|e| eval(e, ctx))
            .find(|v| !v.is_null())
            .unwrap_or(Value::Null),
        Expr::Eq(l, r) => Value::Bool(values_equal(&eval(l, ctx), &eval(r, ctx))),
        Expr::Ne(l, r) => Value::Bool(!values_equal(&eval(l, ctx), &eval(r, ctx))),
        Expr::In(l, r) => {
            let needle = eval(l, ctx);
            match eval(r, ctx) {
                Value::Array(items) => Value::Bool(items.iter().any(|v| values_equal(&needle, v))),
                _ => Value::Bool(false),
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ContextSnapshot {
        ContextSnapshot::from_value(json!({
            "inputs": {"x": "hello", "count": 3, "flag": true, "empty": "", "list": [1, 2]},
            "steps": {"fetch": {"status": "success", "output": {"items": ["a"]}}},
            "ctx": {"summary": "done"}
        }))
    }

    #[test]
    fn test_resolve_reference() {
        let ctx = ctx();
        assert_eq!(resolve("${inputs.x}", &ctx), json!("hello"));
        assert_eq!(resolve("${inputs.count}", &ctx), json!(3));
        assert_eq!(resolve("${steps.fetch.output.items.0}", &ctx), json!("a"));
        assert_eq!(resolve("${inputs.missing}", &ctx), Value::Null);
        assert_eq!(resolve("${a.missing}", &ctx), Value::Null);
    }

    #[test]
    fn test_resolve_interpolation_and_literal() {
        let ctx = ctx();
        assert_eq!(
            resolve("say ${inputs.x} ${inputs.count} times${inputs.nope}", &ctx),
            json!("say hello 3 times")
        );
        assert_eq!(resolve("plain text", &ctx), json!("plain text"));
    }

    #[test]
    fn test_interpolation_keeps_foreign_placeholders() {
        let ctx = ctx();
        assert_eq!(
            resolve("echo ${HOME} ${inputs.x}", &ctx),
            json!("echo ${HOME} hello")
        );
        assert_eq!(
            resolve("cp \"${FILE}\" ${ctx.summary}/${env.DIR}", &ctx),
            json!("cp \"${FILE}\" done/${env.DIR}")
        );
        assert_eq!(resolve("${inputs.x}-${ }", &ctx), json!("hello-${ }"));
    }

    #[test]
    fn test_resolve_coalesce() {
        let ctx = ctx();
        assert_eq!(
            resolve("coalesce(${inputs.nope}, ${ctx.summary}, 'fallback')", &ctx),
            json!("done")
        );
        assert_eq!(resolve("coalesce(${inputs.nope}, 'fallback')", &ctx), json!("fallback"));
        assert_eq!(resolve("coalesce(${inputs.nope})", &ctx), Value::Null);
    }

    #[test]
    fn test_resolve_value_walks_structure() {
        let ctx = ctx();
        let params = json!({"prompt": "Summarize ${inputs.x}", "n": "${inputs.count}", "keep": 1});
        assert_eq!(
            resolve_value(&params, &ctx),
            json!({"prompt": "Summarize hello", "n": 3, "keep": 1})
        );
    }

    #[test]
    fn test_condition_equality() {
        let ctx = ctx();
        assert!(evaluate_condition("${inputs.x} == 'hello'", &ctx));
        assert!(!evaluate_condition("${inputs.x} == 'world'", &ctx));
        assert!(evaluate_condition("${inputs.x} != \"world\"", &ctx));
        assert!(evaluate_condition("${inputs.count} == 3.0", &ctx));
        assert!(evaluate_condition("${steps.fetch.status} == 'success'", &ctx));
    }

    #[test]
    fn test_condition_missing_variable_is_not_an_error() {
        let ctx = ctx();
        assert!(!evaluate_condition("${inputs.missing} == 'value'", &ctx));
        assert!(evaluate_condition("${inputs.missing} == None", &ctx));
        assert!(!evaluate_condition("${inputs.missing}", &ctx));
    }

    #[test]
    fn test_condition_membership() {
        let ctx = ctx();
        assert!(evaluate_condition("${inputs.x} in ['hello', 'hi']", &ctx));
        assert!(!evaluate_condition("${inputs.x} in ['bye']", &ctx));
        assert!(evaluate_condition("2 in ${inputs.list}", &ctx));
        assert!(!evaluate_condition("${inputs.x} in 'hello world'", &ctx));
    }

    #[test]
    fn test_condition_truthiness() {
        let ctx = ctx();
        assert!(evaluate_condition("", &ctx));
        assert!(evaluate_condition("   ", &ctx));
        assert!(evaluate_condition("${inputs.flag}", &ctx));
        assert!(!evaluate_condition("${inputs.empty}", &ctx));
        assert!(evaluate_condition("true", &ctx));
        assert!(!evaluate_condition("False", &ctx));
        assert!(!evaluate_condition("0", &ctx));
        assert!(evaluate_optional(None, &ctx));
    }

    #[test]
    fn test_coalesce_in_condition() {
        let ctx = ctx();
        assert!(evaluate_condition("coalesce(${inputs.mode}, 'fast') == 'fast'", &ctx));
    }

    #[test]
    fn test_disallowed_constructs_fail_closed() {
        let ctx = ctx();
        assert!(!evaluate_condition("__import__('os').system('true')", &ctx));
        assert!(!evaluate_condition("len(${inputs.list}) == 2", &ctx));
        assert!(!evaluate_condition("${inputs.x}.upper() == 'HELLO'", &ctx));
        assert!(!evaluate_condition("${inputs.flag} and true", &ctx));
        assert!(!evaluate_condition("${env.HOME}", &ctx));
        assert!(!evaluate_condition("${inputs.x} == 'unterminated", &ctx));
        assert!(!evaluate_condition("${inputs.x", &ctx));
        assert!(!evaluate_condition("1 + 1 == 2", &ctx));
        assert_eq!(resolve("coalesce(exec('x'))", &ctx), Value::Null);
    }

    #[test]
    fn test_deep_nesting_fails_closed() {
        let ctx = ctx();
        assert!(!evaluate_condition(&"[".repeat(10_000), &ctx));
        assert!(!evaluate_condition(&"coalesce(".repeat(10_000), &ctx));

        let deep = format!("{}1{}", "[".repeat(40), "]".repeat(40));
        assert!(!evaluate_condition(&deep, &ctx));

        let shallow = format!("1 in {}1{}", "[".repeat(1), "]".repeat(1));
        assert!(evaluate_condition(&shallow, &ctx));
        let nested = format!("{}1{}", "[".repeat(8), "]".repeat(8));
        assert!(evaluate_condition(&nested, &ctx));
    }
}
