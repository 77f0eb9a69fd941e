//! Streaming HTML tokenizer.
//!
//! The lexer consumes byte chunks and yields start tags, end tags, text
//! chunks, comments, and doctypes without ever buffering more than one
//! incomplete token. Text is emitted as it arrives: a chunk boundary in
//! the middle of a text node yields a chunk with `last_in_text_node`
//! false, and the final piece of the node (possibly empty) carries true.
//! All delimiters are ASCII, so scanning is byte-wise; text is only split
//! at UTF-8 character boundaries.

/// A lexed token. `raw` preserves the exact input bytes so unmodified
/// markup round-trips verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    StartTag {
        /// Lowercased tag name.
        name: String,
        /// Lowercased attribute names with raw values, in source order.
        attributes: Vec<(String, String)>,
        self_closing: bool,
        raw: Vec<u8>,
    },
    EndTag {
        name: String,
        raw: Vec<u8>,
    },
    Text {
        text: String,
        last_in_text_node: bool,
    },
    Comment {
        text: String,
        raw: Vec<u8>,
    },
    Doctype {
        raw: Vec<u8>,
    },
}

/// Elements whose content is raw text up to the matching close tag.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea", "title"];

/// Elements that never have content or an end tag.
pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Returns whether `name` (lowercase) is a void element.
pub fn is_void_element(name: &str) -> bool {
    VOID_ELEMENTS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    TagOpen,
    EndTagOpen,
    TagName,
    BeforeAttrName,
    AttrName,
    AfterAttrName,
    BeforeAttrValue,
    AttrValueDouble,
    AttrValueSingle,
    AttrValueUnquoted,
    SelfClosingStart,
    MarkupDecl,
    Comment,
    Doctype,
    BogusComment,
    RawText,
}

/// Incremental tokenizer state.
pub struct Lexer {
    state: State,
    /// Accumulated text bytes not yet emitted.
    text: Vec<u8>,
    /// Whether a text node is currently open across emits.
    text_open: bool,
    /// Raw bytes of the token being lexed.
    raw: Vec<u8>,
    tag_name: Vec<u8>,
    attr_name: Vec<u8>,
    attr_value: Vec<u8>,
    attributes: Vec<(String, String)>,
    is_end_tag: bool,
    self_closing: bool,
    /// Declaration prefix buffer used to distinguish comments, doctypes
    /// and bogus comments.
    decl: Vec<u8>,
    comment: Vec<u8>,
    /// Lowercased name of the open raw-text element.
    raw_text_tag: Vec<u8>,
}

impl Default for Lexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Lexer {
    pub fn new() -> Self {
        Self {
            state: State::Data,
            text: Vec::new(),
            text_open: false,
            raw: Vec::new(),
            tag_name: Vec::new(),
            attr_name: Vec::new(),
            attr_value: Vec::new(),
            attributes: Vec::new(),
            is_end_tag: false,
            self_closing: false,
            decl: Vec::new(),
            comment: Vec::new(),
            raw_text_tag: Vec::new(),
        }
    }

    /// Consumes one chunk and returns the tokens it completed. Text that
    /// may continue in the next chunk is flushed with
    /// `last_in_text_node: false`.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Token> {
        let mut out = Vec::new();
        for &byte in chunk {
            self.step(byte, &mut out);
        }
        self.flush_partial_text(&mut out);
        out
    }

    /// Signals end of input, emitting any final text.
    pub fn end(&mut self) -> Vec<Token> {
        let mut out = Vec::new();
        match self.state {
            State::Data | State::RawText => {
                if self.text_open {
                    out.push(self.take_text(true));
                }
            }
            // A truncated tag at end of input is emitted as text, the
            // way browsers recover.
            _ => {
                self.text.extend_from_slice(&self.raw);
                out.push(self.take_text(true));
            }
        }
        self.state = State::Data;
        out
    }

    fn take_text(&mut self, last: bool) -> Token {
        let bytes = std::mem::take(&mut self.text);
        if last {
            self.text_open = false;
        }
        Token::Text {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            last_in_text_node: last,
        }
    }

    /// Flushes buffered text at a chunk boundary, keeping any trailing
    /// incomplete UTF-8 sequence for the next chunk.
    fn flush_partial_text(&mut self, out: &mut Vec<Token>) {
        if !matches!(self.state, State::Data | State::RawText) || self.text.is_empty() {
            return;
        }
        let boundary = utf8_boundary(&self.text);
        if boundary == 0 {
            return;
        }
        let tail = self.text.split_off(boundary);
        let head = std::mem::replace(&mut self.text, tail);
        out.push(Token::Text {
            text: String::from_utf8_lossy(&head).into_owned(),
            last_in_text_node: false,
        });
        self.text_open = true;
    }

    /// Ends the current text node, emitting its final (possibly empty)
    /// chunk.
    fn close_text(&mut self, out: &mut Vec<Token>) {
        if self.text_open || !self.text.is_empty() {
            let token = self.take_text(true);
            out.push(token);
        }
    }

    fn reset_tag(&mut self) {
        self.tag_name.clear();
        self.attr_name.clear();
        self.attr_value.clear();
        self.attributes.clear();
        self.is_end_tag = false;
        self.self_closing = false;
    }

    fn commit_attr(&mut self) {
        if self.attr_name.is_empty() {
            self.attr_value.clear();
            return;
        }
        let name = String::from_utf8_lossy(&self.attr_name).to_ascii_lowercase();
        let value = String::from_utf8_lossy(&self.attr_value).into_owned();
        self.attr_name.clear();
        self.attr_value.clear();
        if !self.attributes.iter().any(|(n, _)| *n == name) {
            self.attributes.push((name, value));
        }
    }

    fn emit_tag(&mut self, out: &mut Vec<Token>) {
        self.commit_attr();
        let name = String::from_utf8_lossy(&self.tag_name).to_ascii_lowercase();
        let raw = std::mem::take(&mut self.raw);
        if self.is_end_tag {
            out.push(Token::EndTag { name, raw });
            self.state = State::Data;
        } else {
            let enters_raw_text =
                !self.self_closing && RAW_TEXT_ELEMENTS.contains(&name.as_str());
            out.push(Token::StartTag {
                name: name.clone(),
                attributes: std::mem::take(&mut self.attributes),
                self_closing: self.self_closing,
                raw,
            });
            if enters_raw_text {
                self.raw_text_tag = name.into_bytes();
                self.state = State::RawText;
            } else {
                self.state = State::Data;
            }
        }
        self.reset_tag();
    }

    fn step(&mut self, byte: u8, out: &mut Vec<Token>) {
        match self.state {
            State::Data => {
                if byte == b'<' {
                    self.raw.clear();
                    self.raw.push(byte);
                    self.state = State::TagOpen;
                } else {
                    self.text.push(byte);
                    self.text_open = true;
                }
            }
            State::TagOpen => {
                self.raw.push(byte);
                match byte {
                    b'/' => self.state = State::EndTagOpen,
                    b'!' => {
                        self.close_text(out);
                        self.decl.clear();
                        self.state = State::MarkupDecl;
                    }
                    b'?' => {
                        self.close_text(out);
                        self.comment.clear();
                        self.state = State::BogusComment;
                    }
                    b if b.is_ascii_alphabetic() => {
                        self.close_text(out);
                        self.reset_tag();
                        self.tag_name.push(byte);
                        self.state = State::TagName;
                    }
                    _ => {
                        // Not markup after all; the bytes are text.
                        self.text.extend_from_slice(&self.raw);
                        self.text_open = true;
                        self.raw.clear();
                        self.state = State::Data;
                    }
                }
            }
            State::EndTagOpen => {
                self.raw.push(byte);
                if byte.is_ascii_alphabetic() {
                    self.close_text(out);
                    self.reset_tag();
                    self.is_end_tag = true;
                    self.tag_name.push(byte);
                    self.state = State::TagName;
                } else {
                    self.close_text(out);
                    self.comment.clear();
                    self.state = State::BogusComment;
                }
            }
            State::TagName => {
                self.raw.push(byte);
                match byte {
                    b'>' => self.emit_tag(out),
                    b'/' => self.state = State::SelfClosingStart,
                    b if b.is_ascii_whitespace() => self.state = State::BeforeAttrName,
                    _ => self.tag_name.push(byte),
                }
            }
            State::BeforeAttrName => {
                self.raw.push(byte);
                match byte {
                    b'>' => self.emit_tag(out),
                    b'/' => self.state = State::SelfClosingStart,
                    b if b.is_ascii_whitespace() => {}
                    _ => {
                        self.attr_name.push(byte);
                        self.state = State::AttrName;
                    }
                }
            }
            State::AttrName => {
                self.raw.push(byte);
                match byte {
                    b'=' => self.state = State::BeforeAttrValue,
                    b'>' => self.emit_tag(out),
                    b'/' => {
                        self.commit_attr();
                        self.state = State::SelfClosingStart;
                    }
                    b if b.is_ascii_whitespace() => self.state = State::AfterAttrName,
                    _ => self.attr_name.push(byte),
                }
            }
            State::AfterAttrName => {
                self.raw.push(byte);
                match byte {
                    b'=' => self.state = State::BeforeAttrValue,
                    b'>' => self.emit_tag(out),
                    b'/' => {
                        self.commit_attr();
                        self.state = State::SelfClosingStart;
                    }
                    b if b.is_ascii_whitespace() => {}
                    _ => {
                        self.commit_attr();
                        self.attr_name.push(byte);
                        self.state = State::AttrName;
                    }
                }
            }
            State::BeforeAttrValue => {
                self.raw.push(byte);
                match byte {
                    b'"' => self.state = State::AttrValueDouble,
                    b'\'' => self.state = State::AttrValueSingle,
                    b'>' => self.emit_tag(out),
                    b if b.is_ascii_whitespace() => {}
                    _ => {
                        self.attr_value.push(byte);
                        self.state = State::AttrValueUnquoted;
                    }
                }
            }
            State::AttrValueDouble => {
                self.raw.push(byte);
                if byte == b'"' {
                    self.commit_attr();
                    self.state = State::BeforeAttrName;
                } else {
                    self.attr_value.push(byte);
                }
            }
            State::AttrValueSingle => {
                self.raw.push(byte);
                if byte == b'\'' {
                    self.commit_attr();
                    self.state = State::BeforeAttrName;
                } else {
                    self.attr_value.push(byte);
                }
            }
            State::AttrValueUnquoted => {
                self.raw.push(byte);
                match byte {
                    b'>' => self.emit_tag(out),
                    b if b.is_ascii_whitespace() => {
                        self.commit_attr();
                        self.state = State::BeforeAttrName;
                    }
                    _ => self.attr_value.push(byte),
                }
            }
            State::SelfClosingStart => {
                self.raw.push(byte);
                match byte {
                    b'>' => {
                        self.self_closing = true;
                        self.emit_tag(out);
                    }
                    _ => {
                        // Stray slash; reprocess as attribute context.
                        self.state = State::BeforeAttrName;
                        self.raw.pop();
                        self.step(byte, out);
                    }
                }
            }
            State::MarkupDecl => {
                self.raw.push(byte);
                self.decl.push(byte);
                if self.decl.starts_with(b"--") {
                    self.comment.clear();
                    self.state = State::Comment;
                } else if self.decl.len() >= 7 {
                    if self.decl[..7].eq_ignore_ascii_case(b"doctype") {
                        self.state = State::Doctype;
                    } else {
                        self.comment = std::mem::take(&mut self.decl);
                        self.state = State::BogusComment;
                    }
                } else if !b"doctype"[..self.decl.len()].eq_ignore_ascii_case(&self.decl)
                    && self.decl != b"-"
                {
                    self.comment = std::mem::take(&mut self.decl);
                    self.state = State::BogusComment;
                }
            }
            State::Comment => {
                self.raw.push(byte);
                self.comment.push(byte);
                if self.comment.ends_with(b"-->") {
                    let content = &self.comment[..self.comment.len() - 3];
                    out.push(Token::Comment {
                        text: String::from_utf8_lossy(content).into_owned(),
                        raw: std::mem::take(&mut self.raw),
                    });
                    self.comment.clear();
                    self.state = State::Data;
                }
            }
            State::Doctype => {
                self.raw.push(byte);
                if byte == b'>' {
                    out.push(Token::Doctype {
                        raw: std::mem::take(&mut self.raw),
                    });
                    self.decl.clear();
                    self.state = State::Data;
                }
            }
            State::BogusComment => {
                self.raw.push(byte);
                if byte == b'>' {
                    out.push(Token::Comment {
                        text: String::from_utf8_lossy(&self.comment).into_owned(),
                        raw: std::mem::take(&mut self.raw),
                    });
                    self.comment.clear();
                    self.state = State::Data;
                } else {
                    self.comment.push(byte);
                }
            }
            State::RawText => {
                self.text.push(byte);
                self.text_open = true;
                // Check whether the buffered tail is `</name`.
                let needle_len = 2 + self.raw_text_tag.len();
                if self.text.len() >= needle_len {
                    let tail_start = self.text.len() - needle_len;
                    let tail = &self.text[tail_start..];
                    if tail[0] == b'<'
                        && tail[1] == b'/'
                        && tail[2..].eq_ignore_ascii_case(&self.raw_text_tag)
                    {
                        let name = self.raw_text_tag.clone();
                        self.text.truncate(tail_start);
                        self.close_text(out);
                        self.reset_tag();
                        self.is_end_tag = true;
                        self.tag_name = name;
                        self.raw.clear();
                        self.raw.push(b'<');
                        self.raw.push(b'/');
                        self.raw.extend_from_slice(&self.tag_name);
                        self.raw_text_tag.clear();
                        self.state = State::TagName;
                    }
                }
            }
        }
    }
}

/// Largest prefix length of `bytes` that ends on a UTF-8 character
/// boundary.
fn utf8_boundary(bytes: &[u8]) -> usize {
    let mut end = bytes.len();
    // A continuation byte or multi-byte leader near the end may belong
    // to an incomplete character.
    let tail_start = bytes.len().saturating_sub(3);
    for idx in (tail_start..bytes.len()).rev() {
        let byte = bytes[idx];
        if byte < 0x80 {
            break;
        }
        if byte >= 0xC0 {
            // Leader byte: complete only if the full sequence is present.
            let width = if byte >= 0xF0 {
                4
            } else if byte >= 0xE0 {
                3
            } else {
                2
            };
            if idx + width > bytes.len() {
                end = idx;
            }
            break;
        }
    }
    end
}
