//! Response lines handed to command callbacks, and a field iterator for
//! picking them apart.
//!
//! A [`Response`] carries the intermediate lines collected for a command in
//! delivery order plus the final result line (or, for PDU notifications,
//! the PDU itself). [`ResponseIter`] walks comma-separated fields the way
//! 27.007 formats them: bare numbers, quoted strings, parenthesised lists
//! and `min-max` ranges.

/// Lines collected for one command or notification.
#[derive(Clone, Debug, Default)]
pub struct Response {
    lines: Vec<String>,
    final_or_pdu: Option<String>,
}

impl Response {
    pub fn new(lines: Vec<String>, final_or_pdu: Option<String>) -> Self {
        Self {
            lines,
            final_or_pdu,
        }
    }

    /// Single-line response, the shape of unsolicited notifications.
    pub fn from_line(line: String) -> Self {
        Self {
            lines: vec![line],
            final_or_pdu: None,
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The final result line (`OK`, `ERROR`, `+CME ERROR: ...`).
    pub fn final_response(&self) -> &str {
        self.final_or_pdu.as_deref().unwrap_or("")
    }

    /// The PDU line of a two-line notification.
    pub fn pdu(&self) -> Option<&str> {
        self.final_or_pdu.as_deref()
    }

    pub fn iter(&self) -> ResponseIter<'_> {
        ResponseIter {
            lines: &self.lines,
            line: None,
            pos: 0,
        }
    }
}

/// Cursor over the fields of response lines.
pub struct ResponseIter<'a> {
    lines: &'a [String],
    line: Option<usize>,
    pos: usize,
}

impl<'a> ResponseIter<'a> {
    /// Advances to the next line starting with `prefix` and positions the
    /// field cursor right after it. An empty prefix matches any line.
    pub fn next_line(&mut self, prefix: &str) -> bool {
        let start = match self.line {
            None => 0,
            Some(i) => i + 1,
        };

        for (i, line) in self.lines.iter().enumerate().skip(start) {
            if line.starts_with(prefix) {
                self.line = Some(i);
                self.pos = prefix.len();
                self.skip_spaces();
                return true;
            }
        }

        false
    }

    fn cur(&self) -> &'a str {
        self.line.map(|i| self.lines[i].as_str()).unwrap_or("")
    }

    /// The unparsed remainder of the current line.
    pub fn raw_line(&self) -> &'a str {
        &self.cur()[self.pos.min(self.cur().len())..]
    }

    fn rest(&self) -> &'a str {
        self.raw_line()
    }

    fn skip_spaces(&mut self) {
        let bytes = self.cur().as_bytes();
        while self.pos < bytes.len() && (bytes[self.pos] == b' ' || bytes[self.pos] == b'\t') {
            self.pos += 1;
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.cur().len()
    }

    /// Consumes the field separator after a parsed field.
    fn end_field(&mut self) {
        self.skip_spaces();
        if self.cur().as_bytes().get(self.pos) == Some(&b',') {
            self.pos += 1;
            self.skip_spaces();
        }
    }

    /// Parses the next decimal number field.
    pub fn next_number(&mut self) -> Option<i32> {
        self.skip_spaces();
        let rest = self.rest();
        let digits: usize = rest.bytes().take_while(u8::is_ascii_digit).count();

        if digits == 0 {
            return None;
        }

        let value: i32 = rest[..digits].parse().ok()?;
        self.pos += digits;
        self.end_field();
        Some(value)
    }

    /// Like [`next_number`](Self::next_number), but an empty field yields
    /// `default`. `None` only at end of line or on a malformed field.
    pub fn next_number_default(&mut self, default: i32) -> Option<i32> {
        self.skip_spaces();

        if self.at_end() {
            return None;
        }

        if self.cur().as_bytes()[self.pos] == b',' {
            self.pos += 1;
            self.skip_spaces();
            return Some(default);
        }

        self.next_number()
    }

    /// Parses a double-quoted string field.
    pub fn next_string(&mut self) -> Option<&'a str> {
        self.skip_spaces();
        let bytes = self.cur().as_bytes();

        if bytes.get(self.pos) != Some(&b'"') {
            return None;
        }

        let start = self.pos + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end] != b'"' {
            end += 1;
        }

        if end >= bytes.len() {
            return None;
        }

        self.pos = end + 1;
        let s = &self.cur()[start..end];
        self.end_field();
        Some(s)
    }

    /// Parses an unquoted string field, up to the next separator.
    pub fn next_unquoted_string(&mut self) -> Option<&'a str> {
        self.skip_spaces();

        if self.at_end() {
            return None;
        }

        let bytes = self.cur().as_bytes();
        let start = self.pos;
        let mut end = start;
        while end < bytes.len() && bytes[end] != b',' && bytes[end] != b')' {
            end += 1;
        }

        self.pos = end;
        let s = self.cur()[start..end].trim_end();
        self.end_field();
        Some(s)
    }

    /// Parses `min-max` or a single number (in which case min == max).
    pub fn next_range(&mut self) -> Option<(i32, i32)> {
        self.skip_spaces();
        let rest = self.rest();
        let digits: usize = rest.bytes().take_while(u8::is_ascii_digit).count();

        if digits == 0 {
            return None;
        }

        let min: i32 = rest[..digits].parse().ok()?;
        self.pos += digits;

        let max = if self.cur().as_bytes().get(self.pos) == Some(&b'-') {
            self.pos += 1;
            let rest = self.rest();
            let digits: usize = rest.bytes().take_while(u8::is_ascii_digit).count();
            if digits == 0 {
                return None;
            }
            let max = rest[..digits].parse().ok()?;
            self.pos += digits;
            max
        } else {
            min
        };

        self.end_field();
        Some((min, max))
    }

    /// Enters a parenthesised list.
    pub fn open_list(&mut self) -> bool {
        self.skip_spaces();
        if self.cur().as_bytes().get(self.pos) == Some(&b'(') {
            self.pos += 1;
            self.skip_spaces();
            true
        } else {
            false
        }
    }

    /// Leaves a parenthesised list.
    pub fn close_list(&mut self) -> bool {
        self.skip_spaces();
        if self.cur().as_bytes().get(self.pos) == Some(&b')') {
            self.pos += 1;
            self.end_field();
            true
        } else {
            false
        }
    }

    /// Skips one field of any kind. `false` when the line is exhausted.
    pub fn skip_next(&mut self) -> bool {
        self.skip_spaces();

        if self.at_end() {
            return false;
        }

        let bytes = self.cur().as_bytes();
        match bytes[self.pos] {
            b'"' => {
                self.next_string().is_some()
            }
            b'(' => {
                let mut depth = 0;
                while self.pos < bytes.len() {
                    match bytes[self.pos] {
                        b'(' => depth += 1,
                        b')' => {
                            depth -= 1;
                            if depth == 0 {
                                self.pos += 1;
                                self.end_field();
                                return true;
                            }
                        }
                        _ => {}
                    }
                    self.pos += 1;
                }
                false
            }
            _ => {
                while self.pos < bytes.len() && bytes[self.pos] != b',' {
                    self.pos += 1;
                }
                self.end_field();
                true
            }
        }
    }
}
