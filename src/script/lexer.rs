//! Tokenizer for the shell script subset

use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    /// Identifiers and keywords; `$` is an identifier character (`$gt`)
    Ident(String),
    Regex { pattern: String, flags: String },
    /// `:name` placeholder
    Named(String),
    /// `?N` placeholder
    Positional(usize),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    /// Character offset in the fragment
    pub pos: usize,
}

// Longest first so `===` wins over `==` and `=`
const PUNCTUATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "++", "--", "+=", "-=", "*=", "/=", "{",
    "}", "[", "]", "(", ")", ",", ";", ":", ".", "?", "+", "-", "*", "/", "%", "<", ">", "=",
    "!",
];

pub struct Lexer {
    input: Vec<char>,
    position: usize,
    tokens: Vec<Spanned>,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            position: 0,
            tokens: Vec::new(),
        }
    }

    fn current_char(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek_char(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Syntax {
            position: self.position,
            message: message.into(),
        }
    }

    /// True if the previous token ends an operand, so `/` divides and `:` separates
    fn after_operand(&self) -> bool {
        match self.tokens.last().map(|t| &t.token) {
            Some(Token::Int(_) | Token::Float(_) | Token::Str(_) | Token::Regex { .. }) => true,
            Some(Token::Named(_) | Token::Positional(_)) => true,
            Some(Token::Ident(word)) => !matches!(
                word.as_str(),
                "return" | "typeof" | "new" | "case" | "in" | "of"
            ),
            Some(Token::Punct(p)) => matches!(*p, ")" | "]"),
            _ => false,
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), ScriptError> {
        loop {
            match (self.current_char(), self.peek_char(1)) {
                (Some(c), _) if c.is_whitespace() => self.advance(),
                (Some('/'), Some('/')) => {
                    while let Some(c) = self.current_char() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                (Some('/'), Some('*')) => {
                    self.position += 2;
                    loop {
                        match (self.current_char(), self.peek_char(1)) {
                            (Some('*'), Some('/')) => {
                                self.position += 2;
                                break;
                            }
                            (Some(_), _) => self.advance(),
                            (None, _) => return Err(self.error("unterminated comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn read_identifier(&mut self) -> String {
        let mut result = String::new();
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '$' {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        result
    }

    fn read_string(&mut self, quote: char) -> Result<String, ScriptError> {
        let mut result = String::new();
        self.advance();

        while let Some(ch) = self.current_char() {
            match ch {
                c if c == quote => {
                    self.advance();
                    return Ok(result);
                }
                '\\' => {
                    self.advance();
                    match self.current_char() {
                        Some('n') => result.push('\n'),
                        Some('t') => result.push('\t'),
                        Some('r') => result.push('\r'),
                        Some('0') => result.push('\0'),
                        Some('u') => {
                            let hex: String = (1..=4).filter_map(|i| self.peek_char(i)).collect();
                            let code = u32::from_str_radix(&hex, 16)
                                .ok()
                                .and_then(char::from_u32)
                                .ok_or_else(|| self.error("invalid \\u escape"))?;
                            result.push(code);
                            self.position += 4;
                        }
                        Some(other) => result.push(other),
                        None => return Err(self.error("unterminated string")),
                    }
                    self.advance();
                }
                _ => {
                    result.push(ch);
                    self.advance();
                }
            }
        }

        Err(self.error("unterminated string"))
    }

    fn read_number(&mut self) -> Result<Token, ScriptError> {
        let mut number = String::new();
        let mut is_float = false;
        if self.current_char() == Some('.') {
            number.push('0');
        }

        while let Some(ch) = self.current_char() {
            if ch.is_ascii_digit() {
                number.push(ch);
                self.advance();
            } else if ch == '.' && !is_float && self.peek_char(1).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                number.push(ch);
                self.advance();
            } else if (ch == 'e' || ch == 'E')
                && self
                    .peek_char(1)
                    .is_some_and(|c| c.is_ascii_digit() || c == '-' || c == '+')
            {
                is_float = true;
                number.push(ch);
                self.advance();
                if let Some(sign @ ('-' | '+')) = self.current_char() {
                    number.push(sign);
                    self.advance();
                }
            } else {
                break;
            }
        }

        if !is_float {
            if let Ok(i) = number.parse::<i64>() {
                return Ok(Token::Int(i));
            }
        }
        number
            .parse::<f64>()
            .map(Token::Float)
            .map_err(|_| self.error(format!("invalid number '{}'", number)))
    }

    fn read_regex(&mut self) -> Result<Token, ScriptError> {
        let start = self.position;
        self.advance();
        let mut pattern = String::new();
        let mut in_class = false;

        loop {
            match self.current_char() {
                None | Some('\n') => {
                    return Err(ScriptError::Syntax {
                        position: start,
                        message: "unterminated regular expression".into(),
                    })
                }
                Some('\\') => {
                    pattern.push('\\');
                    self.advance();
                    if let Some(c) = self.current_char() {
                        pattern.push(c);
                        self.advance();
                    }
                }
                Some('[') => {
                    in_class = true;
                    pattern.push('[');
                    self.advance();
                }
                Some(']') => {
                    in_class = false;
                    pattern.push(']');
                    self.advance();
                }
                Some('/') if !in_class => {
                    self.advance();
                    break;
                }
                Some(c) => {
                    pattern.push(c);
                    self.advance();
                }
            }
        }

        let flags = self.read_identifier();
        if let Some(bad) = flags.chars().find(|c| !"imsxgu".contains(*c)) {
            return Err(self.error(format!("unsupported regular expression flag '{}'", bad)));
        }
        Ok(Token::Regex { pattern, flags })
    }

    fn next_token(&mut self) -> Result<Token, ScriptError> {
        let Some(ch) = self.current_char() else {
            return Ok(Token::Eof);
        };

        match ch {
            '"' | '\'' | '`' => self.read_string(ch).map(Token::Str),
            c if c.is_ascii_digit() => self.read_number(),
            '.' if self.peek_char(1).is_some_and(|c| c.is_ascii_digit()) => self.read_number(),
            c if c.is_alphabetic() || c == '_' || c == '$' => Ok(Token::Ident(self.read_identifier())),
            '/' if !self.after_operand() => self.read_regex(),
            ':' if !self.after_operand()
                && self.peek_char(1).is_some_and(|c| c.is_alphabetic() || c == '_') =>
            {
                self.advance();
                Ok(Token::Named(self.read_identifier()))
            }
            '?' if self.peek_char(1).is_some_and(|c| c.is_ascii_digit()) => {
                self.advance();
                let mut digits = String::new();
                while let Some(d) = self.current_char().filter(|c| c.is_ascii_digit()) {
                    digits.push(d);
                    self.advance();
                }
                digits
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .map(Token::Positional)
                    .ok_or_else(|| self.error("placeholder index must start at 1"))
            }
            _ => {
                let rest: String = self.input[self.position..].iter().take(3).collect();
                match PUNCTUATORS.iter().copied().find(|p| rest.starts_with(*p)) {
                    Some(p) => {
                        self.position += p.len();
                        Ok(Token::Punct(p))
                    }
                    None => Err(self.error(format!("unexpected character '{}'", ch))),
                }
            }
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Spanned>, ScriptError> {
        loop {
            self.skip_whitespace_and_comments()?;
            let pos = self.position;
            let token = self.next_token()?;
            let done = token == Token::Eof;
            self.tokens.push(Spanned { token, pos });
            if done {
                return Ok(self.tokens);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        Lexer::new(src).tokenize().unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_object_literal() {
        assert_eq!(
            tokens("{ age: { $gt: 30 } }"),
            vec![
                Token::Punct("{"),
                Token::Ident("age".into()),
                Token::Punct(":"),
                Token::Punct("{"),
                Token::Ident("$gt".into()),
                Token::Punct(":"),
                Token::Int(30),
                Token::Punct("}"),
                Token::Punct("}"),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(
            tokens("{ a: :min, b: ?2 }"),
            vec![
                Token::Punct("{"),
                Token::Ident("a".into()),
                Token::Punct(":"),
                Token::Named("min".into()),
                Token::Punct(","),
                Token::Ident("b".into()),
                Token::Punct(":"),
                Token::Positional(2),
                Token::Punct("}"),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_regex_versus_division() {
        assert_eq!(
            tokens("x = /^a\\/b[/]/i"),
            vec![
                Token::Ident("x".into()),
                Token::Punct("="),
                Token::Regex { pattern: "^a\\/b[/]".into(), flags: "i".into() },
                Token::Eof,
            ]
        );
        assert_eq!(
            tokens("a / 2"),
            vec![Token::Ident("a".into()), Token::Punct("/"), Token::Int(2), Token::Eof]
        );
    }

    #[test]
    fn test_strings_and_comments() {
        assert_eq!(
            tokens("'it\\'s' // trailing\n/* block */ \"\\u0041\""),
            vec![Token::Str("it's".into()), Token::Str("A".into()), Token::Eof]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            tokens("1 2.5 1e3 .5"),
            vec![Token::Int(1), Token::Float(2.5), Token::Float(1000.0), Token::Float(0.5), Token::Eof]
        );
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(
            Lexer::new("'abc").tokenize(),
            Err(ScriptError::Syntax { .. })
        ));
    }
}
