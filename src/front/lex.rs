//! The lexer.

use derive_more::Display;
use regex::Regex;

/// Tokens in the program
#[derive(Clone, Copy, PartialEq, Eq, Display, Debug)]
#[display("kind: '{kind}', part of input: '{text}'")]
pub struct Token<'src> {
    /// What token class this token belongs to.
    pub kind: TokenKind,
    /// What part of the input this token carries.
    pub text: &'src str,
    /// 1-based source line the token starts on.
    pub line: u32,
}

/// Token classes.
#[derive(Clone, Copy, PartialEq, Eq, Display, Debug)]
pub enum TokenKind {
    #[display("id")]
    Id,
    #[display("num")]
    Num,
    #[display("fn")]
    Fn,
    #[display("struct")]
    Struct,
    #[display("let")]
    Let,
    #[display("new")]
    New,
    #[display("loop")]
    Loop,
    #[display("break")]
    Break,
    #[display("return")]
    Return,
    #[display("if")]
    If,
    #[display("else")]
    Else,
    #[display("true")]
    True,
    #[display("false")]
    False,
    #[display("(")]
    LParen,
    #[display(")")]
    RParen,
    #[display("{{")]
    LBrace,
    #[display("}}")]
    RBrace,
    #[display(",")]
    Comma,
    #[display(":")]
    Colon,
    #[display(";")]
    Semi,
    #[display(".")]
    Dot,
    #[display("->")]
    Arrow,
    #[display("=")]
    Assign,
    #[display("==")]
    Eq,
    #[display("!=")]
    Ne,
    #[display("<=")]
    Le,
    #[display(">=")]
    Ge,
    #[display("<<")]
    Shl,
    #[display(">>>")]
    Shrl,
    #[display(">>")]
    Shr,
    #[display("<")]
    Lt,
    #[display(">")]
    Gt,
    #[display("&&")]
    AndAnd,
    #[display("||")]
    OrOr,
    #[display("&")]
    Amp,
    #[display("|")]
    Pipe,
    #[display("^")]
    Caret,
    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display("*")]
    Star,
    #[display("/")]
    Slash,
}

pub struct LexError(pub u32, pub char);

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Lexer error: unexpected character {:?} at line {}",
            self.1, self.0
        )
    }
}

impl std::fmt::Debug for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

pub struct Lexer<'input> {
    input: &'input str,
    pos: usize,
    line: u32,
    whitespace: Regex,
    matchers: Vec<(Regex, TokenKind)>,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        use TokenKind::*;
        let t = |pat: &str, kind| (Regex::new(pat).unwrap(), kind);
        Lexer {
            input,
            pos: 0,
            line: 1,
            whitespace: Regex::new(r"\A(?:[ \t\f\r\n\x0b]|(?://.*))*").unwrap(),
            // Longer operators come before their prefixes; keywords are
            // matched before the identifier rule.
            matchers: vec![
                t(r"\Afn\b", Fn),
                t(r"\Astruct\b", Struct),
                t(r"\Alet\b", Let),
                t(r"\Anew\b", New),
                t(r"\Aloop\b", Loop),
                t(r"\Abreak\b", Break),
                t(r"\Areturn\b", Return),
                t(r"\Aif\b", If),
                t(r"\Aelse\b", Else),
                t(r"\Atrue\b", True),
                t(r"\Afalse\b", False),
                t(r"\A[A-Za-z_][A-Za-z0-9_]*", Id),
                t(r"\A[0-9]+", Num),
                t(r"\A->", Arrow),
                t(r"\A==", Eq),
                t(r"\A!=", Ne),
                t(r"\A<=", Le),
                t(r"\A>=", Ge),
                t(r"\A<<", Shl),
                t(r"\A>>>", Shrl),
                t(r"\A>>", Shr),
                t(r"\A<", Lt),
                t(r"\A>", Gt),
                t(r"\A&&", AndAnd),
                t(r"\A\|\|", OrOr),
                t(r"\A&", Amp),
                t(r"\A\|", Pipe),
                t(r"\A\^", Caret),
                t(r"\A\+", Plus),
                t(r"\A-", Minus),
                t(r"\A\*", Star),
                t(r"\A/", Slash),
                t(r"\A\(", LParen),
                t(r"\A\)", RParen),
                t(r"\A\{", LBrace),
                t(r"\A\}", RBrace),
                t(r"\A,", Comma),
                t(r"\A:", Colon),
                t(r"\A;", Semi),
                t(r"\A\.", Dot),
                t(r"\A=", Assign),
            ],
        }
    }

    /// Has the lexer reached the end of input?
    pub fn end_of_input(&self) -> bool {
        self.pos == self.input.len()
    }

    fn advance(&mut self, n: usize) {
        let consumed = &self.input[self.pos..self.pos + n];
        self.line += consumed.bytes().filter(|b| *b == b'\n').count() as u32;
        self.pos += n;
    }

    // Skip comments and whitespace
    fn skip_whitespace(&mut self) {
        if let Some(m) = self.whitespace.find(&self.input[self.pos..]) {
            self.advance(m.end())
        }
    }

    /// Get the next token if possible.
    ///
    /// The return type distinguishes between end-of-input and lexer error.
    pub fn next(&mut self) -> Result<Option<Token<'input>>, LexError> {
        self.skip_whitespace();
        if self.end_of_input() {
            return Ok(None);
        }
        let rest = &self.input[self.pos..];
        let mut best: Option<(usize, TokenKind)> = None;
        for (re, kind) in &self.matchers {
            if let Some(m) = re.find(rest) {
                // first match wins ties, so longer operators come first in
                // the table
                if best.map_or(true, |(len, _)| m.end() > len) {
                    best = Some((m.end(), *kind));
                }
            }
        }
        match best {
            Some((len, kind)) => {
                let token = Token {
                    kind,
                    text: &rest[..len],
                    line: self.line,
                };
                self.advance(len);
                Ok(Some(token))
            }
            None => Err(LexError(self.line, rest.chars().next().unwrap())),
        }
    }

    /// Collect all tokens, for the token-dump debug output.
    pub fn tokenize(mut self) -> Result<Vec<Token<'input>>, LexError> {
        let mut tokens = vec![];
        while let Some(token) = self.next()? {
            tokens.push(token);
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn keywords_and_idents() {
        use TokenKind::*;
        assert_eq!(
            kinds("fn ifx if struct lets let"),
            vec![Fn, Id, If, Struct, Id, Let]
        );
    }

    #[test]
    fn maximal_munch_operators() {
        use TokenKind::*;
        assert_eq!(kinds(">>> >> > >= ->"), vec![Shrl, Shr, Gt, Ge, Arrow]);
        assert_eq!(kinds("&& & || | == ="), vec![AndAnd, Amp, OrOr, Pipe, Eq, Assign]);
    }

    #[test]
    fn comments_and_lines() {
        let tokens = Lexer::new("a // comment\nb").tokenize().unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn unknown_character() {
        let err = Lexer::new("a ?").tokenize().unwrap_err();
        assert_eq!(err.1, '?');
    }
}
