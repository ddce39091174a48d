use crate::error::QueryError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    /// A reserved word, upper-cased.
    Keyword(Keyword),
    String(String),
    Int(i64),
    Float(f64),
    /// `@name`
    Bind(String),
    /// `@@name`
    CollectionBind(String),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Colon,
    Dot,
    Range,
    Question,
    /// `=` in `LET x = ...`
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Keyword {
    For,
    In,
    Into,
    Filter,
    Let,
    Limit,
    Insert,
    Update,
    Replace,
    Remove,
    Upsert,
    With,
    Options,
    Collect,
    Count,
    Return,
    Null,
    True,
    False,
    And,
    Or,
    Not,
}

impl Keyword {
    fn from_ident(ident: &str) -> Option<Keyword> {
        let kw = match ident.to_ascii_uppercase().as_str() {
            "FOR" => Keyword::For,
            "IN" => Keyword::In,
            "INTO" => Keyword::Into,
            "FILTER" => Keyword::Filter,
            "LET" => Keyword::Let,
            "LIMIT" => Keyword::Limit,
            "INSERT" => Keyword::Insert,
            "UPDATE" => Keyword::Update,
            "REPLACE" => Keyword::Replace,
            "REMOVE" => Keyword::Remove,
            "UPSERT" => Keyword::Upsert,
            "WITH" => Keyword::With,
            "OPTIONS" => Keyword::Options,
            "COLLECT" => Keyword::Collect,
            "COUNT" => Keyword::Count,
            "RETURN" => Keyword::Return,
            "NULL" => Keyword::Null,
            "TRUE" => Keyword::True,
            "FALSE" => Keyword::False,
            "AND" => Keyword::And,
            "OR" => Keyword::Or,
            "NOT" => Keyword::Not,
            _ => return None,
        };
        Some(kw)
    }

    /// Source spelling, used when a keyword appears as an attribute name.
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Keyword::For => "for",
            Keyword::In => "in",
            Keyword::Into => "into",
            Keyword::Filter => "filter",
            Keyword::Let => "let",
            Keyword::Limit => "limit",
            Keyword::Insert => "insert",
            Keyword::Update => "update",
            Keyword::Replace => "replace",
            Keyword::Remove => "remove",
            Keyword::Upsert => "upsert",
            Keyword::With => "with",
            Keyword::Options => "options",
            Keyword::Collect => "collect",
            Keyword::Count => "count",
            Keyword::Return => "return",
            Keyword::Null => "null",
            Keyword::True => "true",
            Keyword::False => "false",
            Keyword::And => "and",
            Keyword::Or => "or",
            Keyword::Not => "not",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub offset: usize,
}

/// Splits query text into tokens. The result always ends with `Token::Eof`.
pub(crate) fn tokenize(input: &str) -> Result<Vec<Spanned>, QueryError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        // Line and block comments.
        if c == b'/' && bytes.get(pos + 1) == Some(&b'/') {
            while pos < bytes.len() && bytes[pos] != b'\n' {
                pos += 1;
            }
            continue;
        }
        if c == b'/' && bytes.get(pos + 1) == Some(&b'*') {
            let start = pos;
            pos += 2;
            loop {
                if pos + 1 >= bytes.len() {
                    return Err(error_at(input, start, "unterminated comment"));
                }
                if bytes[pos] == b'*' && bytes[pos + 1] == b'/' {
                    pos += 2;
                    break;
                }
                pos += 1;
            }
            continue;
        }

        let start = pos;
        let token = match c {
            b'{' => single(&mut pos, Token::LBrace),
            b'}' => single(&mut pos, Token::RBrace),
            b'[' => single(&mut pos, Token::LBracket),
            b']' => single(&mut pos, Token::RBracket),
            b'(' => single(&mut pos, Token::LParen),
            b')' => single(&mut pos, Token::RParen),
            b',' => single(&mut pos, Token::Comma),
            b':' => single(&mut pos, Token::Colon),
            b'?' => single(&mut pos, Token::Question),
            b'+' => single(&mut pos, Token::Plus),
            b'-' => single(&mut pos, Token::Minus),
            b'*' => single(&mut pos, Token::Star),
            b'/' => single(&mut pos, Token::Slash),
            b'%' => single(&mut pos, Token::Percent),
            b'.' if bytes.get(pos + 1) == Some(&b'.') => {
                pos += 2;
                Token::Range
            }
            b'.' if bytes.get(pos + 1).is_some_and(u8::is_ascii_digit) => {
                lex_number(input, &mut pos)?
            }
            b'.' => single(&mut pos, Token::Dot),
            b'=' if bytes.get(pos + 1) == Some(&b'=') => {
                pos += 2;
                Token::Eq
            }
            b'=' => single(&mut pos, Token::Assign),
            b'!' if bytes.get(pos + 1) == Some(&b'=') => {
                pos += 2;
                Token::Ne
            }
            b'!' => single(&mut pos, Token::Not),
            b'<' if bytes.get(pos + 1) == Some(&b'=') => {
                pos += 2;
                Token::Le
            }
            b'<' => single(&mut pos, Token::Lt),
            b'>' if bytes.get(pos + 1) == Some(&b'=') => {
                pos += 2;
                Token::Ge
            }
            b'>' => single(&mut pos, Token::Gt),
            b'&' if bytes.get(pos + 1) == Some(&b'&') => {
                pos += 2;
                Token::And
            }
            b'|' if bytes.get(pos + 1) == Some(&b'|') => {
                pos += 2;
                Token::Or
            }
            b'\'' | b'"' => lex_string(input, &mut pos)?,
            b'`' => {
                // Quoted identifier.
                let end = input[pos + 1..]
                    .find('`')
                    .ok_or_else(|| error_at(input, pos, "unterminated quoted name"))?;
                let name = input[pos + 1..pos + 1 + end].to_string();
                pos += end + 2;
                Token::Ident(name)
            }
            b'@' => {
                let collection = bytes.get(pos + 1) == Some(&b'@');
                pos += if collection { 2 } else { 1 };
                let name = take_ident(input, &mut pos);
                if name.is_empty() {
                    return Err(error_at(input, start, "invalid bind parameter name"));
                }
                if collection {
                    Token::CollectionBind(name.to_string())
                } else {
                    Token::Bind(name.to_string())
                }
            }
            c if c.is_ascii_digit() => lex_number(input, &mut pos)?,
            c if c.is_ascii_alphabetic() || c == b'_' || c == b'$' => {
                let ident = take_ident(input, &mut pos);
                match Keyword::from_ident(ident) {
                    Some(Keyword::And) => Token::And,
                    Some(Keyword::Or) => Token::Or,
                    Some(kw) => Token::Keyword(kw),
                    None => Token::Ident(ident.to_string()),
                }
            }
            _ => {
                let ch = input[pos..].chars().next().unwrap_or('?');
                return Err(error_at(input, pos, &format!("unexpected character '{ch}'")));
            }
        };
        tokens.push(Spanned {
            token,
            offset: start,
        });
    }

    tokens.push(Spanned {
        token: Token::Eof,
        offset: input.len(),
    });
    Ok(tokens)
}

fn single(pos: &mut usize, token: Token) -> Token {
    *pos += 1;
    token
}

fn take_ident<'a>(input: &'a str, pos: &mut usize) -> &'a str {
    let start = *pos;
    let bytes = input.as_bytes();
    while *pos < bytes.len()
        && (bytes[*pos].is_ascii_alphanumeric() || bytes[*pos] == b'_' || bytes[*pos] == b'$')
    {
        *pos += 1;
    }
    &input[start..*pos]
}

fn lex_number(input: &str, pos: &mut usize) -> Result<Token, QueryError> {
    let bytes = input.as_bytes();
    let start = *pos;
    let mut is_float = false;

    while *pos < bytes.len() && bytes[*pos].is_ascii_digit() {
        *pos += 1;
    }
    // A dot followed by another dot is a range operator, not a fraction.
    if *pos < bytes.len()
        && bytes[*pos] == b'.'
        && bytes.get(*pos + 1).is_some_and(u8::is_ascii_digit)
    {
        is_float = true;
        *pos += 1;
        while *pos < bytes.len() && bytes[*pos].is_ascii_digit() {
            *pos += 1;
        }
    }
    if *pos < bytes.len() && (bytes[*pos] == b'e' || bytes[*pos] == b'E') {
        let mut look = *pos + 1;
        if look < bytes.len() && (bytes[look] == b'+' || bytes[look] == b'-') {
            look += 1;
        }
        if look < bytes.len() && bytes[look].is_ascii_digit() {
            is_float = true;
            *pos = look;
            while *pos < bytes.len() && bytes[*pos].is_ascii_digit() {
                *pos += 1;
            }
        }
    }

    let text = &input[start..*pos];
    if !is_float {
        if let Ok(n) = text.parse::<i64>() {
            return Ok(Token::Int(n));
        }
    }
    text.parse::<f64>()
        .map(Token::Float)
        .map_err(|_| error_at(input, start, &format!("invalid number '{text}'")))
}

fn lex_string(input: &str, pos: &mut usize) -> Result<Token, QueryError> {
    let start = *pos;
    let quote = input.as_bytes()[start] as char;
    let mut out = String::new();
    let mut chars = input[start + 1..].char_indices();

    while let Some((i, ch)) = chars.next() {
        match ch {
            c if c == quote => {
                *pos = start + 1 + i + 1;
                return Ok(Token::String(out));
            }
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, other)) => out.push(other),
                None => break,
            },
            c => out.push(c),
        }
    }
    Err(error_at(input, start, "unterminated string literal"))
}

pub(crate) fn error_at(input: &str, offset: usize, message: &str) -> QueryError {
    let before = &input[..offset.min(input.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.rfind('\n').map_or(before.len(), |nl| before.len() - nl - 1) + 1;
    QueryError::Parse {
        message: message.to_string(),
        line,
        column,
    }
}
