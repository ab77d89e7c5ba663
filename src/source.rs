// Text input and the tokenizer.
//
// InText is the buffered character source: it tracks line and column (tab
// stops included) and exposes charset-driven scanning primitives. Parser
// turns that into the token stream the driver consumes; indentation is
// converted to Begin/End via an indent stack, line ends and ';' become Sep.

use std::fs;

use crate::charset::Charset;
use crate::error::{Error, Result};


pub const DEFAULT_TAB_SIZE: i32 = 8;


lazy_static! {
    static ref WS_CHARS: Charset = Charset::new("\t ");
    static ref IDENT_FIRST: Charset = Charset::new("A-Za-z_");
    static ref IDENT_REST: Charset = Charset::new("0-9A-Za-z_");
    static ref DIGITS: Charset = Charset::new("0-9");
    static ref HEX_DIGITS: Charset = Charset::new("0-9A-Fa-f");
    static ref PRINTABLE_CHARS: Charset = Charset::new("~20-~ff");
    static ref STRING_CHARS: Charset = *PRINTABLE_CHARS - Charset::new("'\\");
    static ref SINGLE_COMMENT_CHARS: Charset = *PRINTABLE_CHARS | *WS_CHARS;
    static ref MULTI_COMMENT_CHARS: Charset = (*PRINTABLE_CHARS - b'}') | *WS_CHARS;
}


pub fn mk_printable_char(c: u8) -> String {
    if c == b'\\' {
        "\\\\".to_string()
    } else if c == b'\'' {
        "\\'".to_string()
    } else if PRINTABLE_CHARS.contains(c) {
        (c as char).to_string()
    } else {
        format!("\\x{:02x}", c)
    }
}

pub fn mk_printable(s: &[u8]) -> String {
    s.iter().map(|&c| mk_printable_char(c)).collect()
}

// String literals denote byte sequences; scalar values up to 0xff (hex
// escapes included) map to single bytes.
pub fn literal_bytes(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for c in s.chars() {
        let v = c as u32;
        if v <= 0xff {
            out.push(v as u8);
        } else {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    out
}

// "dir/name.ext" -> "name"; the default module name for a source file.
pub fn extract_file_name(path: &str) -> String {
    let base = match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    };
    match base.find('.') {
        Some(i) => base[..i].to_string(),
        None => base.to_string(),
    }
}


// In-memory character source. Files are slurped whole; the tokenizer only
// sees the preview/get/token scanning interface.
pub struct InText {
    file_name: String,
    data: Vec<u8>,
    pos: usize,
    linenum: i32,
    column: i32,
    tabsize: i32,
}


impl InText {
    pub fn open(file_name: &str) -> Result<InText> {
        let data = fs::read(file_name).map_err(|e| Error::System {
            file: file_name.to_string(),
            msg: e.to_string(),
        })?;
        Ok(InText::from_bytes(file_name, data))
    }

    pub fn from_bytes(file_name: &str, data: Vec<u8>) -> InText {
        InText {
            file_name: file_name.to_string(),
            data,
            pos: 0,
            linenum: 1,
            column: 0,
            tabsize: DEFAULT_TAB_SIZE,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn line_num(&self) -> i32 {
        self.linenum
    }

    pub fn column(&self) -> i32 {
        self.column
    }

    pub fn eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn preview(&self) -> u8 {
        if self.eof() {
            0
        } else {
            self.data[self.pos]
        }
    }

    pub fn get(&mut self) -> u8 {
        if self.eof() {
            0
        } else {
            let c = self.data[self.pos];
            self.pos += 1;
            c
        }
    }

    fn is_eol_char(c: u8) -> bool {
        c == b'\r' || c == b'\n'
    }

    pub fn eol(&self) -> bool {
        self.eof() || Self::is_eol_char(self.preview())
    }

    pub fn skip_eol(&mut self) {
        if self.preview() == b'\r' {
            self.get();
        }
        if self.preview() == b'\n' {
            self.get();
            self.linenum += 1;
            self.column = 0;
        }
    }

    // Consume the longest run of chars in the set, tracking column and
    // line positions; returns the consumed bytes.
    pub fn token(&mut self, chars: &Charset) -> Vec<u8> {
        let start = self.pos;
        while !self.eof() && chars.contains(self.data[self.pos]) {
            match self.data[self.pos] {
                b'\t' => self.column = ((self.column / self.tabsize) + 1) * self.tabsize,
                b'\n' => {
                    self.linenum += 1;
                    self.column = 0;
                }
                _ => self.column += 1,
            }
            self.pos += 1;
        }
        self.data[start..self.pos].to_vec()
    }

    pub fn skip(&mut self, chars: &Charset) {
        self.token(chars);
    }

    pub fn skip_line(&mut self) {
        let noneol = !Charset::new("\r\n");
        self.skip(&noneol);
        self.skip_eol();
    }
}


#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Token {
    Undefined,
    Begin,
    End,
    Sep,
    Eof,
    Ident,
    IntValue,
    LargeValue,
    StrValue,
    // keywords
    Module,
    Const,
    Def,
    Var,
    TypeOf,
    Enum,
    Echo,
    Assert,
    True,
    False,
    Null,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    Mod,
    // the order in this group is in sync with the comparator opcodes
    Equal,
    LessThan,
    LessEq,
    GreaterEq,
    GreaterThan,
    NotEq,
    // special chars and sequences
    Comma,
    Period,
    Range,
    Div,
    Mul,
    Plus,
    Minus,
    Cat,
    LSquare,
    RSquare,
    LParen,
    RParen,
    Assign,
}


impl Token {
    // Index into the comparator opcode group, in Cmp selector order.
    pub fn comparison(self) -> Option<u8> {
        match self {
            Token::Equal => Some(0),
            Token::LessThan => Some(1),
            Token::LessEq => Some(2),
            Token::GreaterEq => Some(3),
            Token::GreaterThan => Some(4),
            Token::NotEq => Some(5),
            _ => None,
        }
    }
}


// Kept in sorted order; verified by a test because lookup is binary search.
static KEYWORDS: &[(&str, Token)] = &[
    ("and", Token::And),
    ("assert", Token::Assert),
    ("const", Token::Const),
    ("def", Token::Def),
    ("echo", Token::Echo),
    ("enum", Token::Enum),
    ("false", Token::False),
    ("mod", Token::Mod),
    ("module", Token::Module),
    ("not", Token::Not),
    ("null", Token::Null),
    ("or", Token::Or),
    ("shl", Token::Shl),
    ("shr", Token::Shr),
    ("true", Token::True),
    ("typeof", Token::TypeOf),
    ("var", Token::Var),
    ("xor", Token::Xor),
];

fn find_keyword(s: &str) -> Option<Token> {
    KEYWORDS
        .binary_search_by(|(kw, _)| kw.cmp(&s))
        .ok()
        .map(|i| KEYWORDS[i].1)
}


pub struct Parser {
    input: InText,
    blank_line: bool,
    indent_stack: Vec<i32>,
    linenum: i32,

    pub single_line_block: bool, // if a: b = c
    pub token: Token,
    pub str_value: String,
    pub int_value: u64,
    pub large_value: u64,
}


impl Parser {
    pub fn open(file_name: &str) -> Result<Parser> {
        Ok(Parser::new(InText::open(file_name)?))
    }

    pub fn from_bytes(file_name: &str, data: &[u8]) -> Parser {
        Parser::new(InText::from_bytes(file_name, data.to_vec()))
    }

    fn new(input: InText) -> Parser {
        Parser {
            input,
            blank_line: true,
            indent_stack: vec![0],
            linenum: 1,
            single_line_block: false,
            token: Token::Undefined,
            str_value: String::new(),
            int_value: 0,
            large_value: 0,
        }
    }

    pub fn file_name(&self) -> &str {
        self.input.file_name()
    }

    pub fn line_num(&self) -> i32 {
        self.linenum
    }

    pub fn error<T>(&self, msg: &str) -> Result<T> {
        Err(Error::Parser {
            file: self.file_name().to_string(),
            line: self.linenum,
            msg: msg.to_string(),
        })
    }

    fn error_location(&self) -> String {
        if self.str_value.is_empty() {
            String::new()
        } else {
            format!(" near '{}'", self.str_value)
        }
    }

    pub fn error_with_loc<T>(&self, msg: &str) -> Result<T> {
        self.error(&format!("{}{}", msg, self.error_location()))
    }

    pub fn error_not_found<T>(&self, ident: &str) -> Result<T> {
        Err(Error::NotFound {
            file: self.file_name().to_string(),
            line: self.linenum,
            entry: ident.to_string(),
        })
    }

    fn parse_string_literal(&mut self) -> Result<()> {
        self.str_value.clear();
        loop {
            let chunk = self.input.token(&STRING_CHARS);
            self.str_value.push_str(&String::from_utf8_lossy(&chunk));
            if self.input.eof() {
                return self.error("Unexpected end of file in string literal");
            }
            let c = self.input.get();
            if InText::is_eol_char(c) {
                return self.error("Unexpected end of line in string literal");
            }
            if c == b'\'' {
                return Ok(());
            } else if c == b'\\' {
                let c = self.input.get();
                match c {
                    b't' => self.str_value.push('\t'),
                    b'r' => self.str_value.push('\r'),
                    b'n' => self.str_value.push('\n'),
                    b'x' => {
                        let mut s = String::new();
                        if HEX_DIGITS.contains(self.input.preview()) {
                            s.push(self.input.get() as char);
                            if HEX_DIGITS.contains(self.input.preview()) {
                                s.push(self.input.get() as char);
                            }
                            let value = u8::from_str_radix(&s, 16).unwrap();
                            self.str_value.push(value as char);
                        } else {
                            return self.error("Malformed hex sequence");
                        }
                    }
                    _ => self.str_value.push(c as char),
                }
            } else {
                return self.error(&format!(
                    "Illegal character in string literal '{}'",
                    mk_printable_char(c)
                ));
            }
        }
    }

    fn skip_multiline_comment(&mut self) -> Result<()> {
        loop {
            self.input.skip(&MULTI_COMMENT_CHARS);
            if self.input.eol() {
                if self.input.eof() {
                    return self.error("Unexpected end of file in comments");
                }
                self.input.skip_eol();
                self.linenum = self.input.line_num();
                continue;
            }
            let e = self.input.get();
            if e == b'}' {
                if self.input.preview() == b'#' {
                    self.input.get();
                    break;
                }
            } else {
                return self.error(&format!(
                    "Illegal character in comments '{}'",
                    mk_printable_char(e)
                ));
            }
        }
        self.input.skip(&WS_CHARS);
        if !self.input.eol() {
            return self.error("Multiline comments must end with a new line");
        }
        Ok(())
    }

    fn skip_singleline_comment(&mut self) -> Result<()> {
        self.input.skip(&SINGLE_COMMENT_CHARS);
        if !self.input.eol() {
            return self.error(&format!(
                "Illegal character in comments '{}'",
                mk_printable_char(self.input.preview())
            ));
        }
        Ok(())
    }

    fn parse_int_literal(&mut self) -> Result<Token> {
        let s = self.input.token(&DIGITS);
        let (digits, radix) = if s == b"0" && (self.input.preview() | 0x20) == b'x' {
            self.input.get();
            (self.input.token(&HEX_DIGITS), 16)
        } else {
            (s, 10)
        };
        self.str_value = String::from_utf8_lossy(&digits).to_string();
        let value = match u64::from_str_radix(&self.str_value, radix) {
            Ok(v) => v,
            Err(_) => {
                let msg = if digits.is_empty() {
                    format!("'{}' is not a valid number", self.str_value)
                } else {
                    format!("Numeric overflow ({})", self.str_value)
                };
                return self.error(&msg);
            }
        };
        if self.input.preview() == b'L' {
            self.input.get();
            self.large_value = value;
            return Ok(Token::LargeValue);
        }
        self.int_value = value;
        Ok(Token::IntValue)
    }

    pub fn next(&mut self) -> Result<Token> {
        loop {
            self.str_value.clear();

            // Deferred linenum update; this helps to point to a better
            // location in error messages.
            self.linenum = self.input.line_num();

            self.input.skip(&WS_CHARS);

            let c = self.input.preview();

            if self.input.eof() {
                // finalize all indents at end of file
                if self.indent_stack.len() > 1 {
                    self.str_value = "<END>".to_string();
                    self.indent_stack.pop();
                    self.token = Token::End;
                    return Ok(self.token);
                }
                self.str_value = "<EOF>".to_string();
                self.token = Token::Eof;
                return Ok(self.token);
            } else if self.input.eol() {
                self.input.skip_eol();
                if self.blank_line {
                    continue;
                }
                self.blank_line = true; // start from a new line
                if self.single_line_block {
                    self.str_value = "<END>".to_string();
                    self.single_line_block = false;
                    self.token = Token::End;
                } else {
                    self.str_value = "<SEP>".to_string();
                    self.token = Token::Sep;
                }
                return Ok(self.token);
            } else if c == b'#' {
                self.input.get();
                // both variants stop exactly at EOL
                if self.input.preview() == b'{' {
                    self.input.get();
                    self.skip_multiline_comment()?;
                } else {
                    self.skip_singleline_comment()?;
                }
                // a comment on a non-blank line must still yield <SEP>, so
                // blank_line is preserved
                continue;
            } else if self.blank_line {
                // first non-blank, non-comment char on a new line
                let new_indent = self.input.column();
                let old_indent = *self.indent_stack.last().unwrap();
                if new_indent > old_indent {
                    self.str_value = "<BEGIN>".to_string();
                    self.indent_stack.push(new_indent);
                    self.blank_line = false;
                    self.token = Token::Begin;
                    return Ok(self.token);
                } else if new_indent < old_indent {
                    self.str_value = "<END>".to_string();
                    self.indent_stack.pop();
                    let old_indent = *self.indent_stack.last().unwrap();
                    if new_indent > old_indent {
                        return self.error("Unmatched un-indent");
                    } else if new_indent == old_indent {
                        self.blank_line = false;
                    }
                    // otherwise blank_line stays true so that the proper
                    // number of <END>s are generated
                    self.token = Token::End;
                    return Ok(self.token);
                }
                // same indent level: fall through to token analysis
            }

            self.blank_line = false;

            if IDENT_FIRST.contains(c) {
                let mut s = String::new();
                s.push(self.input.get() as char);
                s.push_str(&String::from_utf8_lossy(&self.input.token(&IDENT_REST)));
                self.str_value = s;
                self.token = find_keyword(&self.str_value).unwrap_or(Token::Ident);
                return Ok(self.token);
            } else if DIGITS.contains(c) {
                self.token = self.parse_int_literal()?;
                return Ok(self.token);
            } else {
                let c = self.input.get();
                self.str_value = (c as char).to_string();
                self.token = match c {
                    b'\\' => {
                        self.input.skip(&WS_CHARS);
                        if !self.input.eol() {
                            return self.error("New line expected after '\\'");
                        }
                        self.input.skip_eol();
                        continue;
                    }
                    b',' => Token::Comma,
                    b'.' => {
                        if self.input.preview() == b'.' {
                            self.input.get();
                            Token::Range
                        } else {
                            Token::Period
                        }
                    }
                    b'\'' => {
                        self.parse_string_literal()?;
                        Token::StrValue
                    }
                    b';' => {
                        self.str_value = "<SEP>".to_string();
                        Token::Sep
                    }
                    b':' => {
                        self.input.skip(&WS_CHARS);
                        self.single_line_block = !self.input.eol();
                        Token::Begin
                    }
                    b'/' => Token::Div,
                    b'*' => Token::Mul,
                    b'+' => {
                        if self.input.preview() == b'+' {
                            self.input.get();
                            Token::Cat
                        } else {
                            Token::Plus
                        }
                    }
                    b'-' => Token::Minus,
                    b'[' => Token::LSquare,
                    b']' => Token::RSquare,
                    b'(' => Token::LParen,
                    b')' => Token::RParen,
                    b'<' => {
                        if self.input.preview() == b'=' {
                            self.input.get();
                            Token::LessEq
                        } else if self.input.preview() == b'>' {
                            self.input.get();
                            Token::NotEq
                        } else {
                            Token::LessThan
                        }
                    }
                    b'>' => {
                        if self.input.preview() == b'=' {
                            self.input.get();
                            Token::GreaterEq
                        } else {
                            Token::GreaterThan
                        }
                    }
                    b'=' => {
                        if self.input.preview() == b'=' {
                            self.input.get();
                            Token::Equal
                        } else {
                            Token::Assign
                        }
                    }
                    b'!' => {
                        if self.input.preview() == b'=' {
                            self.input.get();
                            Token::NotEq
                        } else {
                            return self.error("Illegal character '!'");
                        }
                    }
                    _ => {
                        return self
                            .error(&format!("Illegal character '{}'", mk_printable_char(c)));
                    }
                };
                return Ok(self.token);
            }
        }
    }

    pub fn skip_if(&mut self, tok: Token) -> Result<bool> {
        if self.token == tok {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn skip(&mut self, tok: Token, err_name: &str) -> Result<()> {
        if self.token != tok {
            return self.error_with_loc(&format!("'{}' expected", err_name));
        }
        self.next()?;
        Ok(())
    }

    pub fn skip_sep(&mut self) -> Result<()> {
        if self.token != Token::Sep && self.token != Token::Eof {
            return self.error_with_loc("End of statement expected");
        }
        if self.token != Token::Eof {
            self.next()?;
        }
        Ok(())
    }

    pub fn get_ident(&mut self) -> Result<String> {
        if self.token != Token::Ident {
            return self.error_with_loc("Identifier expected");
        }
        let result = self.str_value.clone();
        self.next()?;
        Ok(result)
    }
}
