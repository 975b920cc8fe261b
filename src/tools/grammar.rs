//! 工具调用语法：从模型输出中提取 ```tool_code 围栏块
//!
//! 块内每行一个调用 `name(arg1, arg2, ...)`；参数只能是字面量：双引号字符串、整数、浮点数、
//! true / false。变量、占位符、嵌套调用、关键字参数都使该行解析失败（记录日志后丢弃），
//! 不影响同一块内其它行。块内空行与 `#` 注释行忽略；未闭合的块整体作为一次解析失败。

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// 围栏标记：```tool_code
pub const TOOL_FENCE: &str = "tool_code";

/// 字面量参数
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Literal {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(s) => Some(s),
            _ => None,
        }
    }

    /// 参数的纯文本值（字符串不带引号）
    pub fn to_plain(&self) -> String {
        match self {
            Literal::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => write!(f, "{:?}", s),
            Literal::Int(i) => write!(f, "{}", i),
            Literal::Float(x) => write!(f, "{:?}", x),
            Literal::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// 解析得到的工具调用（一次推理周期内不可变）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub function_name: String,
    pub arguments: Vec<Literal>,
}

impl ToolCall {
    pub fn new(function_name: impl Into<String>, arguments: Vec<Literal>) -> Self {
        Self {
            function_name: function_name.into(),
            arguments,
        }
    }
}

impl fmt::Display for ToolCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.function_name)?;
        for (i, arg) in self.arguments.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", arg)?;
        }
        f.write_str(")")
    }
}

/// 单行解析失败的原因
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseErrorKind {
    #[error("expected function name")]
    ExpectedName,
    #[error("expected '(' after function name")]
    ExpectedOpenParen,
    #[error("expected ',' or ')'")]
    ExpectedCommaOrParen,
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid escape sequence '\\{0}'")]
    InvalidEscape(char),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unresolved placeholder '{0}'")]
    UnresolvedPlaceholder(String),
    #[error("nested call '{0}(...)' is not allowed")]
    NestedCall(String),
    #[error("keyword argument '{0}=' is not allowed")]
    KeywordArgument(String),
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("unexpected trailing input '{0}'")]
    TrailingInput(String),
    #[error("tool block is never closed")]
    UnterminatedBlock,
}

/// 一行（或一个未闭合块）的解析失败
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {kind} in `{text}`")]
pub struct ToolParseError {
    pub line: usize,
    pub text: String,
    pub kind: ParseErrorKind,
}

/// 提取结果：合法调用、失败记录，以及围栏外的正文（思考内容）
#[derive(Debug, Default, Clone)]
pub struct Extraction {
    pub calls: Vec<ToolCall>,
    pub failures: Vec<ToolParseError>,
    pub prose: String,
}

fn is_open_fence(trimmed: &str) -> bool {
    trimmed
        .strip_prefix("```")
        .map(|rest| rest.trim() == TOOL_FENCE)
        .unwrap_or(false)
}

/// 扫描模型输出，提取所有 tool_code 块中的调用
pub fn extract_tool_calls(text: &str) -> Extraction {
    let mut out = Extraction::default();
    let mut prose_lines: Vec<&str> = Vec::new();
    // (开块行号, 块内合法调用, 块内失败)
    let mut block: Option<(usize, Vec<ToolCall>, Vec<ToolParseError>)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw.trim();
        match block.as_mut() {
            None => {
                if is_open_fence(trimmed) {
                    block = Some((line_no, Vec::new(), Vec::new()));
                } else {
                    prose_lines.push(raw);
                }
            }
            Some((_, calls, failures)) => {
                if trimmed == "```" {
                    if let Some((_, calls, failures)) = block.take() {
                        out.calls.extend(calls);
                        out.failures.extend(failures);
                    }
                } else if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                } else {
                    match parse_call(trimmed) {
                        Ok(call) => calls.push(call),
                        Err(kind) => failures.push(ToolParseError {
                            line: line_no,
                            text: trimmed.to_string(),
                            kind,
                        }),
                    }
                }
            }
        }
    }

    if let Some((start, calls, _)) = block {
        tracing::warn!(
            line = start,
            dropped_calls = calls.len(),
            "tool block never closed, dropping it"
        );
        out.failures.push(ToolParseError {
            line: start,
            text: format!("```{}", TOOL_FENCE),
            kind: ParseErrorKind::UnterminatedBlock,
        });
    }

    for failure in &out.failures {
        tracing::warn!(
            line = failure.line,
            text = %failure.text,
            reason = %failure.kind,
            "tool call parse failure"
        );
    }

    out.prose = prose_lines.join("\n").trim().to_string();
    out
}

/// 解析单行 `name(lit, ...)`
pub fn parse_call(line: &str) -> Result<ToolCall, ParseErrorKind> {
    let mut cur = Cursor::new(line);
    cur.skip_ws();
    let name = cur.identifier().ok_or(ParseErrorKind::ExpectedName)?;
    cur.skip_ws();
    if !cur.eat('(') {
        return Err(ParseErrorKind::ExpectedOpenParen);
    }

    let mut arguments = Vec::new();
    cur.skip_ws();
    if !cur.eat(')') {
        loop {
            cur.skip_ws();
            arguments.push(cur.literal()?);
            cur.skip_ws();
            if cur.eat(',') {
                continue;
            }
            if cur.eat(')') {
                break;
            }
            return Err(match cur.peek() {
                Some(c) if c != ',' && c != ')' && !c.is_whitespace() => {
                    ParseErrorKind::UnexpectedChar(c)
                }
                _ => ParseErrorKind::ExpectedCommaOrParen,
            });
        }
    }

    cur.skip_ws();
    let rest = cur.rest();
    if !rest.is_empty() {
        return Err(ParseErrorKind::TrailingInput(rest));
    }
    Ok(ToolCall {
        function_name: name,
        arguments,
    })
}

struct Cursor {
    chars: Vec<char>,
    pos: usize,
}

impl Cursor {
    fn new(s: &str) -> Self {
        Self {
            chars: s.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn rest(&self) -> String {
        self.chars[self.pos..].iter().collect()
    }

    fn identifier(&mut self) -> Option<String> {
        let first = self.peek()?;
        if !(first.is_ascii_alphabetic() || first == '_') {
            return None;
        }
        let mut ident = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                ident.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        Some(ident)
    }

    fn literal(&mut self) -> Result<Literal, ParseErrorKind> {
        match self.peek() {
            None => Err(ParseErrorKind::ExpectedCommaOrParen),
            Some('"') => self.string(),
            Some(c) if c == '-' || c == '+' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() || c == '_' => self.word(),
            Some(open @ ('{' | '<' | '$')) => Err(ParseErrorKind::UnresolvedPlaceholder(
                self.placeholder(open),
            )),
            Some(c) => Err(ParseErrorKind::UnexpectedChar(c)),
        }
    }

    fn string(&mut self) -> Result<Literal, ParseErrorKind> {
        self.bump(); // 开引号
        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(ParseErrorKind::UnterminatedString),
                Some('"') => return Ok(Literal::Str(value)),
                Some('\\') => match self.bump() {
                    Some('"') => value.push('"'),
                    Some('\\') => value.push('\\'),
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(other) => return Err(ParseErrorKind::InvalidEscape(other)),
                    None => return Err(ParseErrorKind::UnterminatedString),
                },
                Some(c) => value.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<Literal, ParseErrorKind> {
        let mut raw = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E' | '_') {
                raw.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        let is_float = raw.contains(['.', 'e', 'E']);
        if is_float {
            match raw.parse::<f64>() {
                Ok(x) if x.is_finite() => Ok(Literal::Float(x)),
                _ => Err(ParseErrorKind::InvalidNumber(raw)),
            }
        } else {
            raw.parse::<i64>()
                .map(Literal::Int)
                .map_err(|_| ParseErrorKind::InvalidNumber(raw))
        }
    }

    /// 裸标识符：只有布尔字面量合法，其余视为未解析的变量 / 嵌套调用 / 关键字参数
    fn word(&mut self) -> Result<Literal, ParseErrorKind> {
        let word = self.identifier().unwrap_or_default();
        let save = self.pos;
        self.skip_ws();
        match self.peek() {
            Some('(') => return Err(ParseErrorKind::NestedCall(word)),
            Some('=') => return Err(ParseErrorKind::KeywordArgument(word)),
            _ => self.pos = save,
        }
        match word.as_str() {
            "true" | "True" => Ok(Literal::Bool(true)),
            "false" | "False" => Ok(Literal::Bool(false)),
            _ => Err(ParseErrorKind::UnresolvedPlaceholder(word)),
        }
    }

    fn placeholder(&mut self, open: char) -> String {
        let close = match open {
            '{' => Some('}'),
            '<' => Some('>'),
            _ => None,
        };
        let mut token = String::new();
        while let Some(c) = self.bump() {
            token.push(c);
            if Some(c) == close {
                break;
            }
            if close.is_none() && token.len() > 1 && !(c.is_ascii_alphanumeric() || c == '_') {
                token.pop();
                break;
            }
        }
        token
    }
}
