//! Selector-driven streaming HTML rewriter.
//!
//! `on(selector, handlers)` registers element/comment/text callbacks for
//! elements matching a CSS-like selector; `on_document(handlers)`
//! registers document-level callbacks (doctype, comments, text, end).
//! `transform(response)` returns a response whose body is lazily consumed
//! and re-emitted with mutations applied: the tokenizer feeds a
//! dispatcher that invokes handlers (suspending while they run) and
//! pushes rewritten output through a bounded channel, so each committed
//! prefix is emitted promptly and back-pressure flows to the source.
//!
//! Content insertions are text-escaped by default; `ContentOptions { html:
//! true }` inserts raw HTML. Selector strings are parsed at transform
//! time, so an unsupported pseudo-class fails the transform rather than
//! registration. Errors thrown by handlers abort the transform and
//! propagate to the consumer of the body stream. Instances share no
//! state; concurrent rewrites are independent.
//!
//! # Examples
//!
//! ```rust
//! use kumo::rewriter::{ContentOptions, ElementContentHandlers, HtmlRewriter};
//!
//! let mut rewriter = HtmlRewriter::new();
//! rewriter.on(
//!     "p:nth-child(2)",
//!     ElementContentHandlers::default().element(|mut el| {
//!         Box::pin(async move {
//!             el.set_inner_content("new", ContentOptions::default());
//!             Ok(el)
//!         })
//!     }),
//! );
//! ```

use std::collections::HashMap;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header;
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    body::KumoBody,
    error::{KumoError, Result},
    types::Response,
};

mod lexer;
mod selector;

use lexer::{Lexer, Token, is_void_element};
use selector::{ElementInfo, Selector};

/// Controls how inserted content is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentOptions {
    /// Insert raw HTML instead of escaped text.
    pub html: bool,
}

#[derive(Debug, Clone)]
enum Content {
    Text(String),
    Html(String),
}

impl Content {
    fn new(content: &str, options: ContentOptions) -> Self {
        if options.html {
            Content::Html(content.to_string())
        } else {
            Content::Text(content.to_string())
        }
    }

    fn render(&self, out: &mut Vec<u8>) {
        match self {
            Content::Html(html) => out.extend_from_slice(html.as_bytes()),
            Content::Text(text) => out.extend_from_slice(escape_text(text).as_bytes()),
        }
    }
}

/// Escapes `&`, `<` and `>` for text insertion.
fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

/// A matched element start tag, exposed to element handlers.
pub struct Element {
    tag_name: String,
    attributes: Vec<(String, String)>,
    attrs_modified: bool,
    before: Vec<Content>,
    after: Vec<Content>,
    prepend_content: Vec<Content>,
    append_content: Vec<Content>,
    inner_content: Option<Content>,
    replacement: Option<Content>,
    removed: bool,
    keep_content: bool,
    end_tag_handlers: Vec<EndTagHandler>,
}

impl Element {
    /// Lowercased tag name.
    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    /// Attribute value, if present.
    pub fn get_attribute(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.attributes
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the attribute is present.
    pub fn has_attribute(&self, name: &str) -> bool {
        self.get_attribute(name).is_some()
    }

    /// All attributes in source order.
    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    /// Sets (or replaces) an attribute; the start tag is re-serialized.
    pub fn set_attribute(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        self.attrs_modified = true;
        if let Some(slot) = self.attributes.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value.to_string();
        } else {
            self.attributes.push((name, value.to_string()));
        }
    }

    /// Removes an attribute if present.
    pub fn remove_attribute(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        let before = self.attributes.len();
        self.attributes.retain(|(n, _)| *n != name);
        if self.attributes.len() != before {
            self.attrs_modified = true;
        }
    }

    /// Inserts content before the element.
    pub fn before(&mut self, content: &str, options: ContentOptions) {
        self.before.push(Content::new(content, options));
    }

    /// Inserts content after the element (after its end tag).
    pub fn after(&mut self, content: &str, options: ContentOptions) {
        self.after.push(Content::new(content, options));
    }

    /// Inserts content right after the start tag.
    pub fn prepend(&mut self, content: &str, options: ContentOptions) {
        self.prepend_content.push(Content::new(content, options));
    }

    /// Inserts content right before the end tag.
    pub fn append(&mut self, content: &str, options: ContentOptions) {
        self.append_content.push(Content::new(content, options));
    }

    /// Replaces the element's children with the given content.
    pub fn set_inner_content(&mut self, content: &str, options: ContentOptions) {
        self.inner_content = Some(Content::new(content, options));
    }

    /// Replaces the whole element (children included) with the given
    /// content.
    pub fn replace(&mut self, content: &str, options: ContentOptions) {
        self.replacement = Some(Content::new(content, options));
    }

    /// Removes the element and its children.
    pub fn remove(&mut self) {
        self.removed = true;
        self.keep_content = false;
    }

    /// Removes the element's tags, keeping its children.
    pub fn remove_and_keep_content(&mut self) {
        self.removed = true;
        self.keep_content = true;
    }

    /// Registers a handler invoked when the element's end tag is
    /// reached. Never invoked for void or self-closing elements.
    pub fn on_end_tag(&mut self, handler: EndTagHandler) {
        self.end_tag_handlers.push(handler);
    }
}

/// The end tag of a matched element.
pub struct EndTag {
    name: String,
    before: Vec<Content>,
    after: Vec<Content>,
    removed: bool,
}

impl EndTag {
    /// Lowercased tag name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inserts content before the end tag.
    pub fn before(&mut self, content: &str, options: ContentOptions) {
        self.before.push(Content::new(content, options));
    }

    /// Inserts content after the end tag.
    pub fn after(&mut self, content: &str, options: ContentOptions) {
        self.after.push(Content::new(content, options));
    }

    /// Removes the end tag from the output.
    pub fn remove(&mut self) {
        self.removed = true;
    }
}

/// A chunk of a text node.
pub struct TextChunk {
    text: String,
    last_in_text_node: bool,
    before: Vec<Content>,
    after: Vec<Content>,
    replacement: Option<Content>,
    removed: bool,
}

impl TextChunk {
    /// The chunk's text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether this is the final chunk of its text node.
    pub fn last_in_text_node(&self) -> bool {
        self.last_in_text_node
    }

    /// Inserts content before the chunk.
    pub fn before(&mut self, content: &str, options: ContentOptions) {
        self.before.push(Content::new(content, options));
    }

    /// Inserts content after the chunk.
    pub fn after(&mut self, content: &str, options: ContentOptions) {
        self.after.push(Content::new(content, options));
    }

    /// Replaces the chunk.
    pub fn replace(&mut self, content: &str, options: ContentOptions) {
        self.replacement = Some(Content::new(content, options));
    }

    /// Removes the chunk.
    pub fn remove(&mut self) {
        self.removed = true;
    }
}

/// An HTML comment.
pub struct Comment {
    text: String,
    before: Vec<Content>,
    after: Vec<Content>,
    replacement: Option<Content>,
    removed: bool,
}

impl Comment {
    /// The comment text between the markers.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Inserts content before the comment.
    pub fn before(&mut self, content: &str, options: ContentOptions) {
        self.before.push(Content::new(content, options));
    }

    /// Inserts content after the comment.
    pub fn after(&mut self, content: &str, options: ContentOptions) {
        self.after.push(Content::new(content, options));
    }

    /// Replaces the comment.
    pub fn replace(&mut self, content: &str, options: ContentOptions) {
        self.replacement = Some(Content::new(content, options));
    }

    /// Removes the comment.
    pub fn remove(&mut self) {
        self.removed = true;
    }
}

/// The document's doctype, read-only.
pub struct Doctype {
    raw: String,
}

impl Doctype {
    /// The raw doctype markup.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// The end of the document; content can still be appended.
pub struct DocumentEnd {
    append: Vec<Content>,
}

impl DocumentEnd {
    /// Appends content at the very end of the output.
    pub fn append(&mut self, content: &str, options: ContentOptions) {
        self.append.push(Content::new(content, options));
    }
}

/// Async handler invoked for each matched element start tag. Handlers
/// take the token value, mutate it, and hand it back; the pipeline
/// suspends until the returned future completes.
pub type ElementHandler = Box<dyn FnMut(Element) -> BoxFuture<'static, Result<Element>> + Send>;
/// Async handler invoked for each text chunk in a matched element.
pub type TextHandler = Box<dyn FnMut(TextChunk) -> BoxFuture<'static, Result<TextChunk>> + Send>;
/// Async handler invoked for each comment in a matched element.
pub type CommentHandler = Box<dyn FnMut(Comment) -> BoxFuture<'static, Result<Comment>> + Send>;
/// Async handler invoked for the document's doctype.
pub type DoctypeHandler = Box<dyn FnMut(Doctype) -> BoxFuture<'static, Result<Doctype>> + Send>;
/// Async handler invoked once at the end of the document.
pub type DocumentEndHandler =
    Box<dyn FnMut(DocumentEnd) -> BoxFuture<'static, Result<DocumentEnd>> + Send>;
/// Synchronous handler invoked at a matched element's end tag.
pub type EndTagHandler = Box<dyn FnOnce(&mut EndTag) -> Result<()> + Send>;

/// Callbacks attached to a selector.
#[derive(Default)]
pub struct ElementContentHandlers {
    element: Option<ElementHandler>,
    comments: Option<CommentHandler>,
    text: Option<TextHandler>,
}

impl ElementContentHandlers {
    /// Sets the element handler.
    pub fn element<F>(mut self, handler: F) -> Self
    where
        F: FnMut(Element) -> BoxFuture<'static, Result<Element>> + Send + 'static,
    {
        self.element = Some(Box::new(handler));
        self
    }

    /// Sets the comment handler for comments inside matched elements.
    pub fn comments<F>(mut self, handler: F) -> Self
    where
        F: FnMut(Comment) -> BoxFuture<'static, Result<Comment>> + Send + 'static,
    {
        self.comments = Some(Box::new(handler));
        self
    }

    /// Sets the text handler for text inside matched elements.
    pub fn text<F>(mut self, handler: F) -> Self
    where
        F: FnMut(TextChunk) -> BoxFuture<'static, Result<TextChunk>> + Send + 'static,
    {
        self.text = Some(Box::new(handler));
        self
    }
}

/// Document-level callbacks, invoked once per document.
#[derive(Default)]
pub struct DocumentContentHandlers {
    doctype: Option<DoctypeHandler>,
    comments: Option<CommentHandler>,
    text: Option<TextHandler>,
    end: Option<DocumentEndHandler>,
}

impl DocumentContentHandlers {
    /// Sets the doctype handler.
    pub fn doctype<F>(mut self, handler: F) -> Self
    where
        F: FnMut(Doctype) -> BoxFuture<'static, Result<Doctype>> + Send + 'static,
    {
        self.doctype = Some(Box::new(handler));
        self
    }

    /// Sets the handler for every comment in the document.
    pub fn comments<F>(mut self, handler: F) -> Self
    where
        F: FnMut(Comment) -> BoxFuture<'static, Result<Comment>> + Send + 'static,
    {
        self.comments = Some(Box::new(handler));
        self
    }

    /// Sets the handler for every text chunk in the document.
    pub fn text<F>(mut self, handler: F) -> Self
    where
        F: FnMut(TextChunk) -> BoxFuture<'static, Result<TextChunk>> + Send + 'static,
    {
        self.text = Some(Box::new(handler));
        self
    }

    /// Sets the document-end handler.
    pub fn end<F>(mut self, handler: F) -> Self
    where
        F: FnMut(DocumentEnd) -> BoxFuture<'static, Result<DocumentEnd>> + Send + 'static,
    {
        self.end = Some(Box::new(handler));
        self
    }
}

/// The rewriter: a handler registry plus `transform`.
#[derive(Default)]
pub struct HtmlRewriter {
    element_handlers: Vec<(String, ElementContentHandlers)>,
    document_handlers: Vec<DocumentContentHandlers>,
}

impl HtmlRewriter {
    /// Creates an empty rewriter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers handlers for elements matching `selector`. The selector
    /// is parsed at transform time.
    pub fn on(&mut self, selector: &str, handlers: ElementContentHandlers) -> &mut Self {
        self.element_handlers.push((selector.to_string(), handlers));
        self
    }

    /// Registers document-level handlers.
    pub fn on_document(&mut self, handlers: DocumentContentHandlers) -> &mut Self {
        self.document_handlers.push(handlers);
        self
    }

    /// Transforms the response body, streaming rewritten output. Handler
    /// and selector errors surface as errors on the returned body
    /// stream.
    pub fn transform(self, response: Response) -> Response {
        let (mut parts, body) = response.into_parts();
        parts.headers.remove(header::CONTENT_LENGTH);

        let (tx, rx) = mpsc::channel::<Result<Bytes, KumoError>>(16);
        tokio::spawn(async move {
            if let Err(e) = run_pipeline(self, body, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        Response::from_parts(parts, KumoBody::from_stream(ReceiverStream::new(rx)))
    }
}

struct OpenElement {
    info: ElementInfo,
    emit_end_tag: bool,
    drop_content: bool,
    append: Vec<Content>,
    after: Vec<Content>,
    end_tag_handlers: Vec<EndTagHandler>,
    matched: Vec<usize>,
    child_count: u32,
    type_counts: HashMap<String, u32>,
}

struct Pipeline {
    selectors: Vec<(Selector, ElementContentHandlers)>,
    document: Vec<DocumentContentHandlers>,
    stack: Vec<OpenElement>,
    root_child_count: u32,
    root_type_counts: HashMap<String, u32>,
    /// Number of stack entries whose content is being dropped.
    suppress: usize,
    out: Vec<u8>,
}

async fn run_pipeline(
    rewriter: HtmlRewriter,
    body: KumoBody,
    tx: &mpsc::Sender<Result<Bytes, KumoError>>,
) -> Result<()> {
    let mut selectors = Vec::with_capacity(rewriter.element_handlers.len());
    for (raw, handlers) in rewriter.element_handlers {
        selectors.push((Selector::parse(&raw)?, handlers));
    }

    let mut pipeline = Pipeline {
        selectors,
        document: rewriter.document_handlers,
        stack: Vec::new(),
        root_child_count: 0,
        root_type_counts: HashMap::new(),
        suppress: 0,
        out: Vec::new(),
    };
    let mut lexer = Lexer::new();
    let mut body = body;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| KumoError::io(e))?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        for token in lexer.feed(&data) {
            pipeline.process(token).await?;
        }
        pipeline.flush(tx).await?;
    }
    for token in lexer.end() {
        pipeline.process(token).await?;
    }
    pipeline.document_end().await?;
    pipeline.flush(tx).await?;
    Ok(())
}

impl Pipeline {
    async fn flush(&mut self, tx: &mpsc::Sender<Result<Bytes, KumoError>>) -> Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::take(&mut self.out));
        tx.send(Ok(chunk)).await.map_err(|_| {
            KumoError::io("rewritten body receiver dropped")
        })?;
        Ok(())
    }

    fn emit_raw(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    fn emit_contents(&mut self, contents: &[Content]) {
        let mut out = std::mem::take(&mut self.out);
        for content in contents {
            content.render(&mut out);
        }
        self.out = out;
    }

    async fn process(&mut self, token: Token) -> Result<()> {
        match token {
            Token::StartTag {
                name,
                attributes,
                self_closing,
                raw,
            } => self.process_start_tag(name, attributes, self_closing, raw).await,
            Token::EndTag { name, raw } => self.process_end_tag(&name, &raw),
            Token::Text {
                text,
                last_in_text_node,
            } => self.process_text(text, last_in_text_node).await,
            Token::Comment { text, raw } => self.process_comment(text, &raw).await,
            Token::Doctype { raw } => self.process_doctype(&raw).await,
        }
    }

    async fn process_start_tag(
        &mut self,
        name: String,
        attributes: Vec<(String, String)>,
        self_closing: bool,
        raw: Vec<u8>,
    ) -> Result<()> {
        let void = self_closing || is_void_element(&name);

        if self.suppress > 0 {
            // Inside dropped content: keep the stack balanced, emit and
            // match nothing.
            if !void {
                self.stack.push(OpenElement {
                    info: ElementInfo {
                        tag_name: name,
                        ..Default::default()
                    },
                    emit_end_tag: false,
                    drop_content: true,
                    append: Vec::new(),
                    after: Vec::new(),
                    end_tag_handlers: Vec::new(),
                    matched: Vec::new(),
                    child_count: 0,
                    type_counts: HashMap::new(),
                });
                self.suppress += 1;
            }
            return Ok(());
        }

        // Sibling position bookkeeping on the parent.
        let (child_index, type_index) = {
            let (count, types) = match self.stack.last_mut() {
                Some(parent) => (&mut parent.child_count, &mut parent.type_counts),
                None => (&mut self.root_child_count, &mut self.root_type_counts),
            };
            *count += 1;
            let type_count = types.entry(name.clone()).or_insert(0);
            *type_count += 1;
            (*count, *type_count)
        };

        let info = ElementInfo {
            tag_name: name.clone(),
            attributes: attributes.clone(),
            child_index,
            type_index,
        };
        let path: Vec<ElementInfo> = self
            .stack
            .iter()
            .map(|e| e.info.clone())
            .chain(std::iter::once(info.clone()))
            .collect();
        let matched: Vec<usize> = self
            .selectors
            .iter()
            .enumerate()
            .filter(|(_, (selector, _))| selector.matches(&path))
            .map(|(idx, _)| idx)
            .collect();

        let mut element = Element {
            tag_name: name.clone(),
            attributes,
            attrs_modified: false,
            before: Vec::new(),
            after: Vec::new(),
            prepend_content: Vec::new(),
            append_content: Vec::new(),
            inner_content: None,
            replacement: None,
            removed: false,
            keep_content: false,
            end_tag_handlers: Vec::new(),
        };
        for idx in &matched {
            if let Some(handler) = &mut self.selectors[*idx].1.element {
                element = handler(element).await?;
            }
        }

        self.emit_contents(&element.before);

        let entry_after = element.after.clone();
        if let Some(replacement) = &element.replacement {
            let replacement = replacement.clone();
            self.emit_contents(std::slice::from_ref(&replacement));
            if void {
                self.emit_contents(&entry_after);
            } else {
                self.stack.push(OpenElement {
                    info,
                    emit_end_tag: false,
                    drop_content: true,
                    append: Vec::new(),
                    after: entry_after,
                    end_tag_handlers: Vec::new(),
                    matched,
                    child_count: 0,
                    type_counts: HashMap::new(),
                });
                self.suppress += 1;
            }
            return Ok(());
        }

        if element.removed {
            if void {
                self.emit_contents(&entry_after);
            } else {
                let drop_content = !element.keep_content;
                self.stack.push(OpenElement {
                    info,
                    emit_end_tag: false,
                    drop_content,
                    append: Vec::new(),
                    after: entry_after,
                    end_tag_handlers: Vec::new(),
                    matched,
                    child_count: 0,
                    type_counts: HashMap::new(),
                });
                if drop_content {
                    self.suppress += 1;
                }
            }
            return Ok(());
        }

        // Ordinary (possibly attribute-rewritten) start tag.
        if element.attrs_modified {
            let mut tag = Vec::new();
            tag.push(b'<');
            tag.extend_from_slice(element.tag_name.as_bytes());
            for (attr_name, value) in &element.attributes {
                tag.push(b' ');
                tag.extend_from_slice(attr_name.as_bytes());
                tag.extend_from_slice(b"=\"");
                tag.extend_from_slice(escape_attribute(value).as_bytes());
                tag.push(b'"');
            }
            if self_closing {
                tag.extend_from_slice(b" />");
            } else {
                tag.push(b'>');
            }
            self.emit_raw(&tag);
        } else {
            self.emit_raw(&raw);
        }

        self.emit_contents(&element.prepend_content);

        if void {
            self.emit_contents(&entry_after);
            return Ok(());
        }

        let drop_content = if let Some(inner) = &element.inner_content {
            let inner = inner.clone();
            self.emit_contents(std::slice::from_ref(&inner));
            true
        } else {
            false
        };

        self.stack.push(OpenElement {
            info,
            emit_end_tag: true,
            drop_content,
            append: element.append_content,
            after: entry_after,
            end_tag_handlers: element.end_tag_handlers,
            matched,
            child_count: 0,
            type_counts: HashMap::new(),
        });
        if drop_content {
            self.suppress += 1;
        }
        Ok(())
    }

    fn process_end_tag(&mut self, name: &str, raw: &[u8]) -> Result<()> {
        let Some(match_depth) = self
            .stack
            .iter()
            .rposition(|entry| entry.info.tag_name == name)
        else {
            if self.suppress == 0 {
                self.emit_raw(raw);
            }
            return Ok(());
        };

        // Implicitly close unclosed children above the match.
        while self.stack.len() > match_depth + 1 {
            let entry = self.stack.pop().expect("stack entry");
            if entry.drop_content {
                self.suppress -= 1;
            }
            if self.suppress == 0 {
                self.emit_contents(&entry.append);
                self.emit_contents(&entry.after);
            }
        }

        let entry = self.stack.pop().expect("matching stack entry");
        if entry.drop_content {
            self.suppress -= 1;
        }
        if self.suppress > 0 {
            return Ok(());
        }

        self.emit_contents(&entry.append);
        if entry.emit_end_tag {
            let mut end_tag = EndTag {
                name: name.to_string(),
                before: Vec::new(),
                after: Vec::new(),
                removed: false,
            };
            for handler in entry.end_tag_handlers {
                handler(&mut end_tag)?;
            }
            self.emit_contents(&end_tag.before);
            if !end_tag.removed {
                self.emit_raw(raw);
            }
            self.emit_contents(&end_tag.after);
        }
        self.emit_contents(&entry.after);
        Ok(())
    }

    async fn process_text(&mut self, text: String, last_in_text_node: bool) -> Result<()> {
        if self.suppress > 0 {
            return Ok(());
        }
        let mut chunk = TextChunk {
            text,
            last_in_text_node,
            before: Vec::new(),
            after: Vec::new(),
            replacement: None,
            removed: false,
        };

        for doc in &mut self.document {
            if let Some(handler) = &mut doc.text {
                chunk = handler(chunk).await?;
            }
        }
        // Element text handlers fire for text anywhere inside a matched
        // element's subtree, in registration order, once each.
        let mut fired: Vec<usize> = self
            .stack
            .iter()
            .flat_map(|entry| entry.matched.iter().copied())
            .collect();
        fired.sort_unstable();
        fired.dedup();
        for idx in fired {
            if let Some(handler) = &mut self.selectors[idx].1.text {
                chunk = handler(chunk).await?;
            }
        }

        self.emit_contents(&chunk.before);
        if !chunk.removed {
            match &chunk.replacement {
                Some(replacement) => {
                    let replacement = replacement.clone();
                    self.emit_contents(std::slice::from_ref(&replacement));
                }
                None => self.emit_raw(chunk.text.as_bytes()),
            }
        }
        self.emit_contents(&chunk.after);
        Ok(())
    }

    async fn process_comment(&mut self, text: String, raw: &[u8]) -> Result<()> {
        if self.suppress > 0 {
            return Ok(());
        }
        let mut comment = Comment {
            text,
            before: Vec::new(),
            after: Vec::new(),
            replacement: None,
            removed: false,
        };

        for doc in &mut self.document {
            if let Some(handler) = &mut doc.comments {
                comment = handler(comment).await?;
            }
        }
        let mut fired: Vec<usize> = self
            .stack
            .iter()
            .flat_map(|entry| entry.matched.iter().copied())
            .collect();
        fired.sort_unstable();
        fired.dedup();
        for idx in fired {
            if let Some(handler) = &mut self.selectors[idx].1.comments {
                comment = handler(comment).await?;
            }
        }

        self.emit_contents(&comment.before);
        if !comment.removed {
            match &comment.replacement {
                Some(replacement) => {
                    let replacement = replacement.clone();
                    self.emit_contents(std::slice::from_ref(&replacement));
                }
                None => self.emit_raw(raw),
            }
        }
        self.emit_contents(&comment.after);
        Ok(())
    }

    async fn process_doctype(&mut self, raw: &[u8]) -> Result<()> {
        let mut doctype = Doctype {
            raw: String::from_utf8_lossy(raw).into_owned(),
        };
        for doc in &mut self.document {
            if let Some(handler) = &mut doc.doctype {
                doctype = handler(doctype).await?;
            }
        }
        self.emit_raw(doctype.raw.as_bytes());
        Ok(())
    }

    async fn document_end(&mut self) -> Result<()> {
        let mut end = DocumentEnd { append: Vec::new() };
        for doc in &mut self.document {
            if let Some(handler) = &mut doc.end {
                end = handler(end).await?;
            }
        }
        self.emit_contents(&end.append);
        Ok(())
    }
}

/// Escapes a re-serialized attribute value.
fn escape_attribute(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}
