//! `eval_tool`: evaluates an arithmetic expression.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! sum     = product (('+' | '-') product)*
//! product = signed (('*' | '/') signed)*
//! signed  = ('-' | '+') signed | atom
//! atom    = NUMBER | '(' sum ')'
//! ```
//!
//! Nesting deeper than [`MAX_DEPTH`] is rejected instead of recursing further.

use std::iter::Peekable;
use std::str::Chars;

use agentgate_core::error::ToolError;
use agentgate_core::tool::{Tool, ToolArguments};
use async_trait::async_trait;

pub const NAME: &str = "eval_tool";

/// Deepest nesting of parentheses and unary signs accepted.
pub const MAX_DEPTH: usize = 256;

pub struct EvalTool;

#[async_trait]
impl Tool for EvalTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression and return the result. \
         Supports +, -, *, /, parentheses and decimal numbers."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "The arithmetic expression to evaluate, e.g. '(10 + 10) * 5'"
                }
            },
            "required": ["expression"]
        })
    }

    async fn execute(&self, arguments: &ToolArguments) -> Result<String, ToolError> {
        let expression = arguments
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'expression' argument".into()))?;

        let value = evaluate(expression).map_err(|reason| ToolError::ExecutionFailed {
            tool_name: NAME.into(),
            reason: format!("cannot evaluate '{expression}': {reason}"),
        })?;
        Ok(format_number(value))
    }
}

/// Integral results render without a decimal point.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Evaluate an arithmetic expression.
pub fn evaluate(expression: &str) -> Result<f64, String> {
    let mut parser = Parser {
        chars: expression.chars().peekable(),
        depth: 0,
    };
    let value = parser.sum()?;
    parser.skip_ws();
    if let Some(c) = parser.chars.peek() {
        return Err(format!("unexpected '{c}'"));
    }
    if !value.is_finite() {
        return Err("result is not a finite number".into());
    }
    Ok(value)
}

struct Parser<'a> {
    chars: Peekable<Chars<'a>>,
    depth: usize,
}

impl Parser<'_> {
    fn skip_ws(&mut self) {
        while self.chars.next_if(|c| c.is_whitespace()).is_some() {}
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        self.chars.next_if_eq(&expected).is_some()
    }

    fn sum(&mut self) -> Result<f64, String> {
        let mut acc = self.product()?;
        loop {
            if self.eat('+') {
                acc += self.product()?;
            } else if self.eat('-') {
                acc -= self.product()?;
            } else {
                return Ok(acc);
            }
        }
    }

    fn product(&mut self) -> Result<f64, String> {
        let mut acc = self.signed()?;
        loop {
            if self.eat('*') {
                acc *= self.signed()?;
            } else if self.eat('/') {
                let divisor = self.signed()?;
                if divisor == 0.0 {
                    return Err("division by zero".into());
                }
                acc /= divisor;
            } else {
                return Ok(acc);
            }
        }
    }

    fn signed(&mut self) -> Result<f64, String> {
        if self.depth >= MAX_DEPTH {
            return Err("expression nested too deeply".into());
        }
        self.depth += 1;
        let value = self.unary();
        self.depth -= 1;
        value
    }

    fn unary(&mut self) -> Result<f64, String> {
        if self.eat('-') {
            return Ok(-self.signed()?);
        }
        if self.eat('+') {
            return self.signed();
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<f64, String> {
        if self.eat('(') {
            let value = self.sum()?;
            if !self.eat(')') {
                return Err("missing ')'".into());
            }
            return Ok(value);
        }

        self.skip_ws();
        let mut literal = String::new();
        while let Some(c) = self.chars.next_if(|c| c.is_ascii_digit() || *c == '.') {
            literal.push(c);
        }
        match (literal.is_empty(), self.chars.peek()) {
            (true, Some(c)) => Err(format!("unexpected '{c}'")),
            (true, None) => Err("unexpected end of expression".into()),
            (false, _) => literal
                .parse()
                .map_err(|_| format!("invalid number '{literal}'")),
        }
    }
}
