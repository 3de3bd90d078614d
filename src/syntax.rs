//! Byte-level lexer for AT response streams.
//!
//! The chat engine feeds received bytes together with a hint chosen from
//! command context; the lexer answers with how many bytes it consumed and a
//! classification of the unit that ended there. `Unsure` means "feed me
//! more". The consumed span always includes the terminating byte, so the
//! caller can extract the unit and drain the ring buffer in one step.

/// What the engine expects next, based on the command in flight.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Hint {
    /// A plain response line.
    #[default]
    None,
    /// Additional lines of a multi-line response.
    Multiline,
    /// The second, hex-encoded line of a two-line PDU response.
    Pdu,
    /// A bare `> ` prompt without the usual leading CR LF.
    ShortPrompt,
}

/// Classification of a complete unit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LexResult {
    /// Need more bytes.
    Unsure,
    /// A complete response line.
    Line,
    /// A complete line while in multi-line mode.
    Multiline,
    /// A complete PDU line.
    Pdu,
    /// A `> ` prompt; the modem is waiting for payload.
    Prompt,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    /// No content seen yet in this unit; leading CR/LF are swallowed.
    LineStart,
    /// Accumulating line content.
    Content,
    /// Saw `>` as the first content byte, maybe a prompt.
    MaybePrompt,
}

/// Permissive AT lexer.
///
/// Quoted strings suppress CR/LF framing, which keeps operator names and
/// USSD strings with embedded newlines intact.
pub struct Lexer {
    state: State,
    hint: Hint,
    in_string: bool,
}

impl Default for Lexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Lexer {
    pub fn new() -> Self {
        Self {
            state: State::LineStart,
            hint: Hint::None,
            in_string: false,
        }
    }

    pub fn set_hint(&mut self, hint: Hint) {
        self.hint = hint;
    }

    pub fn hint(&self) -> Hint {
        self.hint
    }

    fn reset_unit(&mut self) {
        self.state = State::LineStart;
        self.in_string = false;
    }

    /// Feeds `bytes`, returning the number consumed and the unit result.
    /// On anything other than `Unsure` the hint is reset to `None`.
    pub fn feed(&mut self, bytes: &[u8]) -> (usize, LexResult) {
        let mut i = 0;

        while i < bytes.len() {
            let b = bytes[i];

            match self.state {
                State::LineStart => match b {
                    b'\r' | b'\n' => {
                        i += 1;
                    }
                    b'>' if self.hint != Hint::Pdu => {
                        self.state = State::MaybePrompt;
                        i += 1;
                    }
                    _ => {
                        self.state = State::Content;
                        // Reprocess as content.
                    }
                },

                State::MaybePrompt => {
                    if b == b' ' {
                        i += 1;
                        return self.finish(i, LexResult::Prompt);
                    }
                    // Not a prompt after all; the `>` was line content.
                    self.state = State::Content;
                }

                State::Content => {
                    if self.hint != Hint::Pdu && b == b'"' {
                        self.in_string = !self.in_string;
                        i += 1;
                        continue;
                    }

                    if !self.in_string && (b == b'\r' || b == b'\n') {
                        i += 1;
                        let res = match self.hint {
                            Hint::Pdu => LexResult::Pdu,
                            Hint::Multiline => LexResult::Multiline,
                            _ => LexResult::Line,
                        };
                        return self.finish(i, res);
                    }

                    i += 1;
                }
            }
        }

        (i, LexResult::Unsure)
    }

    fn finish(&mut self, consumed: usize, result: LexResult) -> (usize, LexResult) {
        self.reset_unit();
        self.hint = Hint::None;
        (consumed, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(lexer: &mut Lexer, bytes: &[u8]) -> (usize, LexResult) {
        let mut consumed = 0;
        loop {
            let (n, res) = lexer.feed(&bytes[consumed..]);
            consumed += n;
            if res != LexResult::Unsure || consumed == bytes.len() {
                return (consumed, res);
            }
        }
    }

    #[test]
    fn simple_line() {
        let mut lexer = Lexer::new();
        let (n, res) = feed_all(&mut lexer, b"\r\nOK\r\n");
        assert_eq!(res, LexResult::Line);
        assert_eq!(n, 5); // trailing \n belongs to the next unit
    }

    #[test]
    fn line_split_across_feeds() {
        let mut lexer = Lexer::new();
        let (n, res) = lexer.feed(b"\r\n+CSQ: ");
        assert_eq!(res, LexResult::Unsure);
        assert_eq!(n, 8);

        let (_, res) = lexer.feed(b"17,99\r");
        assert_eq!(res, LexResult::Line);
    }

    #[test]
    fn quoted_string_hides_cr() {
        let mut lexer = Lexer::new();
        let (_, res) = feed_all(&mut lexer, b"+COPS: \"Oper\rator\"\r");
        assert_eq!(res, LexResult::Line);
    }

    #[test]
    fn prompt_after_crlf() {
        let mut lexer = Lexer::new();
        let (n, res) = feed_all(&mut lexer, b"\r\n> ");
        assert_eq!(res, LexResult::Prompt);
        assert_eq!(n, 4);
    }

    #[test]
    fn short_prompt_without_crlf() {
        let mut lexer = Lexer::new();
        lexer.set_hint(Hint::ShortPrompt);
        let (n, res) = feed_all(&mut lexer, b"> ");
        assert_eq!(res, LexResult::Prompt);
        assert_eq!(n, 2);
    }

    #[test]
    fn gt_in_line_is_not_a_prompt() {
        let mut lexer = Lexer::new();
        let (_, res) = feed_all(&mut lexer, b">PACKET\r");
        assert_eq!(res, LexResult::Line);
    }

    #[test]
    fn pdu_hint_classifies_next_line() {
        let mut lexer = Lexer::new();
        lexer.set_hint(Hint::Pdu);
        let (_, res) = feed_all(&mut lexer, b"07914400000000F001000B\r");
        assert_eq!(res, LexResult::Pdu);
        // Hint resets after the unit.
        assert_eq!(lexer.hint(), Hint::None);
    }

    #[test]
    fn multiline_hint_tags_result() {
        let mut lexer = Lexer::new();
        lexer.set_hint(Hint::Multiline);
        let (_, res) = feed_all(&mut lexer, b"+CMGL: 2\r");
        assert_eq!(res, LexResult::Multiline);
    }
}
