//! Post composition controller: turns local typing into live post commands.
//!
//! DESIGN
//! ======
//! The controller is sans-IO. Callers feed it local input and server events
//! through [`Composer`] methods, then drain the resulting [`Effect`]s and
//! execute them (send a command, trim the text field, replace its contents).
//! All flow control lives in an [`Fsm`] over [`PostState`]; the mutable draft
//! is the machine's context.
//!
//! Edits are diffed against the last body *sent*, not the raw text field, so
//! a view that briefly echoes stale content cannot desynchronize the server.
//!
//! LIFECYCLE
//! =========
//! `Idle` → first non-blank input or a file sends `INSERT_POST` and moves to
//! `PendingAllocation`. Edits made while the allocation is in flight are sent
//! immediately; the server applies them in order. The server's `PostId`
//! moves the draft to `Live`. Connection loss or a verification gate moves
//! any editing draft to `Buffering`, where input replaces a single buffered
//! copy of the text. On resume the buffer is flushed as one diff, or as one
//! allocation if nothing was allocated yet. A draft that had requested an
//! allocation before the connection dropped first reclaims its post by nonce.
//! `Finalize` flushes, sends `FINISH_POST` and parks in terminal `Closed`,
//! which still records a `PostId` that arrives late.

use std::fmt::Write as _;

use frames::limits::{MAX_POST_CHARS, MAX_POST_LINES, char_count, is_blank, truncate_chars};
use frames::{Command, Event, PostId, PostRequest, RECLAIM_FAILED, ThreadId, diff};
use rand::Rng;
use tracing::{debug, warn};

use crate::fsm::{Fsm, Queue};
use crate::quote;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PostState {
    Idle,
    PendingAllocation,
    Live,
    Buffering,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PostEvent {
    Input,
    File,
    Allocated,
    ReclaimFailed,
    Disconnect,
    Reconnect,
    CaptchaRequired,
    CaptchaSolved,
    Flush,
    Finalize,
}

/// Argument carried by a [`PostEvent`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    None,
    Text(String),
    Token(String),
    Post { id: PostId, op: ThreadId },
}

impl Arg {
    fn text(&self) -> &str {
        match self {
            Self::Text(text) => text,
            _ => "",
        }
    }
}

/// Work the host must carry out on the controller's behalf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Write a command to the connection.
    Send(Command),
    /// Drop this many trailing code points from the text field.
    TrimInput(usize),
    /// Replace the text field. `commit` is false when the text was only
    /// buffered locally.
    ReplaceText { text: String, commit: bool },
    /// The draft is finished; no further input is accepted.
    Closed,
}

/// Poster details attached to the allocation request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Author {
    pub name: Option<String>,
    pub email: Option<String>,
    pub staff: Option<StaffCredentials>,
}

/// Staff role to display and the session token proving it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaffCredentials {
    pub role: String,
    pub session: String,
}

/// Mutable draft state; the machine's context.
#[derive(Debug)]
pub struct Draft {
    author: Author,
    op: ThreadId,
    id: Option<PostId>,
    nonce: String,
    /// Body as last sent to the server.
    body: String,
    editing: bool,
    connected: bool,
    needs_captcha: bool,
    alloc_requested: bool,
    allocated: bool,
    needs_reclaim: bool,
    reclaiming: bool,
    finish_pending: bool,
    close_notified: bool,
    /// Latest full text not yet sent.
    buffered_text: Option<String>,
    buffered_file: Option<String>,
    image: Option<String>,
    last_linked: Option<PostId>,
    effects: Vec<Effect>,
}

type Q = Queue<PostEvent, Arg>;

// =============================================================================
// DRAFT OPERATIONS
// =============================================================================

impl Draft {
    fn new(op: ThreadId, author: Author) -> Self {
        Self {
            author,
            op,
            id: None,
            nonce: new_nonce(),
            body: String::new(),
            editing: true,
            connected: true,
            needs_captcha: false,
            alloc_requested: false,
            allocated: false,
            needs_reclaim: false,
            reclaiming: false,
            finish_pending: false,
            close_notified: false,
            buffered_text: None,
            buffered_file: None,
            image: None,
            last_linked: None,
            effects: Vec::new(),
        }
    }

    fn send(&mut self, command: Command) {
        self.effects.push(Effect::Send(command));
    }

    /// Apply the body caps, asking the view to trim whatever was cut.
    fn limit(&mut self, text: &str) -> String {
        let mut text = text.to_owned();
        loop {
            let chars = char_count(&text);
            if chars > MAX_POST_CHARS {
                self.effects.push(Effect::TrimInput(chars - MAX_POST_CHARS));
                text = truncate_chars(&text, MAX_POST_CHARS).to_owned();
                continue;
            }
            let cut = text.match_indices('\n').nth(MAX_POST_LINES - 1).map(|(i, _)| i);
            if let Some(cut) = cut {
                let trimmed = text[..cut].to_owned();
                self.effects.push(Effect::TrimInput(chars - char_count(&trimmed)));
                text = trimmed;
                continue;
            }
            return text;
        }
    }

    fn has_buffered_content(&self) -> bool {
        self.buffered_file.is_some() || self.buffered_text.as_deref().is_some_and(|t| !is_blank(t))
    }

    fn buffer_text(&mut self, text: String) {
        self.buffered_text = (!text.is_empty()).then_some(text);
    }

    /// Send the minimal edit from the last-sent body to `text`.
    fn commit(&mut self, text: String) {
        if let Some(edit) = diff(&self.body, &text) {
            self.body = text;
            self.send(edit.into());
        }
    }

    fn attach(&mut self, token: String) {
        if self.image.is_some() {
            debug!("draft already has an image; ignoring file");
            return;
        }
        self.image = Some(token.clone());
        self.send(Command::InsertImage { token });
    }

    fn flush(&mut self) {
        if let Some(text) = self.buffered_text.take() {
            self.commit(text);
        }
        if let Some(token) = self.buffered_file.take() {
            self.attach(token);
        }
    }

    fn request_alloc(&mut self, text: Option<String>, image: Option<String>) {
        let mut req = PostRequest::new(self.nonce.clone());
        req.op = Some(self.op);
        req.name.clone_from(&self.author.name);
        req.email.clone_from(&self.author.email);
        if let Some(staff) = &self.author.staff {
            req.auth = Some(staff.role.clone());
            req.session = Some(staff.session.clone());
        }
        if let Some(text) = text.filter(|t| !is_blank(t)) {
            self.body.clone_from(&text);
            req.frag = Some(text);
        }
        if let Some(token) = image {
            self.image = Some(token.clone());
            req.image = Some(token);
        }

        debug!(op = self.op, nonce = %self.nonce, "requesting post allocation");
        self.alloc_requested = true;
        self.send(Command::InsertPost(req));
    }

    fn allocate_buffered(&mut self) {
        let text = self.buffered_text.take();
        let image = self.buffered_file.take();
        self.request_alloc(text, image);
    }

    fn assign(&mut self, id: PostId, op: ThreadId) {
        self.reclaiming = false;
        if self.allocated {
            if self.id != Some(id) {
                warn!(current = ?self.id, id, "ignoring conflicting post id");
            }
            return;
        }
        debug!(id, op, "post allocated");
        self.allocated = true;
        self.id = Some(id);
        self.op = op;
    }

    /// Pick up where the draft left off once connected and unblocked.
    fn resume(&mut self) -> PostState {
        if self.alloc_requested {
            if self.needs_reclaim {
                self.needs_reclaim = false;
                self.reclaiming = true;
                debug!(nonce = %self.nonce, "reclaiming post after reconnect");
                self.send(Command::ReclaimPost { nonce: self.nonce.clone() });
                return PostState::PendingAllocation;
            }
            return if self.allocated { PostState::Live } else { PostState::PendingAllocation };
        }
        if self.has_buffered_content() {
            self.allocate_buffered();
            return PostState::PendingAllocation;
        }
        PostState::Idle
    }

    /// The server lost the post. Start over with the full current text.
    fn reallocate(&mut self) -> PostState {
        self.reclaiming = false;
        self.needs_reclaim = false;
        self.alloc_requested = false;
        self.allocated = false;
        self.id = None;
        self.nonce = new_nonce();

        let text = match self.buffered_text.take() {
            Some(text) => text,
            None => self.body.clone(),
        };
        self.body.clear();
        let image = self.buffered_file.take().or_else(|| self.image.take());

        if is_blank(&text) && image.is_none() {
            self.buffer_text(text);
            return PostState::Idle;
        }
        self.request_alloc(Some(text), image);
        PostState::PendingAllocation
    }

    fn finish(&mut self) {
        if self.alloc_requested {
            self.flush();
        } else if self.has_buffered_content() {
            self.allocate_buffered();
        }
        if self.alloc_requested {
            self.send(Command::FinishPost);
        }
        self.buffered_text = None;
        self.buffered_file = None;
        self.finish_pending = false;
        self.editing = false;
    }

    fn pending_work(&self, queue: &mut Q) {
        if self.finish_pending {
            queue.push(PostEvent::Finalize, Arg::None);
        } else if self.buffered_text.is_some() || self.buffered_file.is_some() {
            queue.push(PostEvent::Flush, Arg::None);
        }
    }
}

fn new_nonce() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    let mut out = String::with_capacity(32);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

// =============================================================================
// TRANSITIONS
// =============================================================================

fn idle_input(d: &mut Draft, arg: &Arg, _: &mut Q) -> PostState {
    let text = d.limit(arg.text());
    if is_blank(&text) {
        d.buffer_text(text);
        return PostState::Idle;
    }
    d.buffered_text = None;
    let image = d.buffered_file.take();
    d.request_alloc(Some(text), image);
    PostState::PendingAllocation
}

fn idle_file(d: &mut Draft, arg: &Arg, _: &mut Q) -> PostState {
    let Arg::Token(token) = arg else {
        return PostState::Idle;
    };
    let text = d.buffered_text.take();
    d.request_alloc(text, Some(token.clone()));
    PostState::PendingAllocation
}

fn pending_input(d: &mut Draft, arg: &Arg, _: &mut Q) -> PostState {
    let text = d.limit(arg.text());
    if d.reclaiming {
        d.buffered_text = Some(text);
    } else {
        d.commit(text);
    }
    PostState::PendingAllocation
}

fn pending_file(d: &mut Draft, arg: &Arg, _: &mut Q) -> PostState {
    if let Arg::Token(token) = arg {
        if d.reclaiming {
            d.buffered_file = Some(token.clone());
        } else {
            d.attach(token.clone());
        }
    }
    PostState::PendingAllocation
}

fn allocated(d: &mut Draft, arg: &Arg, _: &mut Q) -> PostState {
    if let Arg::Post { id, op } = arg {
        d.assign(*id, *op);
    }
    PostState::Live
}

fn live_input(d: &mut Draft, arg: &Arg, _: &mut Q) -> PostState {
    let text = d.limit(arg.text());
    d.commit(text);
    PostState::Live
}

fn live_file(d: &mut Draft, arg: &Arg, _: &mut Q) -> PostState {
    if let Arg::Token(token) = arg {
        d.attach(token.clone());
    }
    PostState::Live
}

fn buffer_input(d: &mut Draft, arg: &Arg, _: &mut Q) -> PostState {
    let text = d.limit(arg.text());
    d.buffered_text = Some(text);
    PostState::Buffering
}

fn buffer_file(d: &mut Draft, arg: &Arg, _: &mut Q) -> PostState {
    if let Arg::Token(token) = arg {
        d.buffered_file = Some(token.clone());
    }
    PostState::Buffering
}

fn buffer_allocated(d: &mut Draft, arg: &Arg, _: &mut Q) -> PostState {
    if let Arg::Post { id, op } = arg {
        d.assign(*id, *op);
    }
    PostState::Buffering
}

fn reconnect(d: &mut Draft, _: &Arg, _: &mut Q) -> PostState {
    d.connected = true;
    if d.needs_captcha {
        return PostState::Buffering;
    }
    d.resume()
}

fn captcha_solved(d: &mut Draft, _: &Arg, _: &mut Q) -> PostState {
    d.needs_captcha = false;
    if !d.connected {
        return PostState::Buffering;
    }
    d.resume()
}

fn disconnect(d: &mut Draft, _: &Arg, _: &mut Q) -> PostState {
    d.connected = false;
    if d.alloc_requested {
        d.needs_reclaim = true;
        d.reclaiming = false;
    }
    if d.editing { PostState::Buffering } else { PostState::Closed }
}

fn captcha_required(d: &mut Draft, _: &Arg, _: &mut Q) -> PostState {
    d.needs_captcha = true;
    if d.editing { PostState::Buffering } else { PostState::Closed }
}

fn finalize(d: &mut Draft, _: &Arg, _: &mut Q) -> PostState {
    d.finish();
    PostState::Closed
}

fn defer_finalize(state: PostState) -> impl FnMut(&mut Draft, &Arg, &mut Q) -> PostState {
    move |d: &mut Draft, _: &Arg, _: &mut Q| {
        d.finish_pending = true;
        state
    }
}

fn machine() -> Fsm<PostState, PostEvent, Arg, Draft> {
    use PostEvent as E;
    use PostState as S;

    let mut fsm = Fsm::new(S::Idle);

    fsm.act(S::Idle, E::Input, idle_input);
    fsm.act(S::Idle, E::File, idle_file);
    fsm.act(S::Idle, E::Finalize, finalize);

    fsm.act(S::PendingAllocation, E::Input, pending_input);
    fsm.act(S::PendingAllocation, E::File, pending_file);
    fsm.act(S::PendingAllocation, E::Allocated, allocated);
    fsm.act(S::PendingAllocation, E::ReclaimFailed, |d: &mut Draft, _: &Arg, _: &mut Q| {
        d.reallocate()
    });
    fsm.act(S::PendingAllocation, E::Flush, |d: &mut Draft, _: &Arg, _: &mut Q| {
        d.flush();
        S::PendingAllocation
    });
    fsm.act(S::PendingAllocation, E::Finalize, |d: &mut Draft, arg: &Arg, q: &mut Q| {
        if d.reclaiming {
            d.finish_pending = true;
            return S::PendingAllocation;
        }
        finalize(d, arg, q)
    });

    fsm.act(S::Live, E::Input, live_input);
    fsm.act(S::Live, E::File, live_file);
    fsm.act(S::Live, E::Flush, |d: &mut Draft, _: &Arg, _: &mut Q| {
        d.flush();
        S::Live
    });
    fsm.act(S::Live, E::Finalize, finalize);

    fsm.act(S::Buffering, E::Input, buffer_input);
    fsm.act(S::Buffering, E::File, buffer_file);
    fsm.act(S::Buffering, E::Allocated, buffer_allocated);
    fsm.act(S::Buffering, E::Reconnect, reconnect);
    fsm.act(S::Buffering, E::CaptchaSolved, captcha_solved);
    fsm.act(S::Buffering, E::Finalize, defer_finalize(S::Buffering));

    // Finalized before the allocation came back; still record the id.
    fsm.act(S::Closed, E::Allocated, |d: &mut Draft, arg: &Arg, _: &mut Q| {
        if let Arg::Post { id, op } = arg {
            d.assign(*id, *op);
        }
        S::Closed
    });

    fsm.wild_act(E::Disconnect, disconnect);
    fsm.wild_act(E::CaptchaRequired, captcha_required);

    fsm.on(S::Idle, |d: &mut Draft, _: &Arg, q: &mut Q| {
        if d.finish_pending {
            q.push(E::Finalize, Arg::None);
        }
    });
    fsm.on(S::PendingAllocation, |d: &mut Draft, _: &Arg, q: &mut Q| {
        if !d.reclaiming {
            d.pending_work(q);
        }
    });
    fsm.on(S::Live, |d: &mut Draft, _: &Arg, q: &mut Q| d.pending_work(q));
    fsm.on(S::Closed, |d: &mut Draft, _: &Arg, _: &mut Q| {
        if !d.close_notified {
            d.close_notified = true;
            d.effects.push(Effect::Closed);
        }
    });

    fsm
}

// =============================================================================
// COMPOSER
// =============================================================================

/// A single draft reply and the machine driving it.
pub struct Composer {
    fsm: Fsm<PostState, PostEvent, Arg, Draft>,
    draft: Draft,
}

impl Composer {
    /// New idle draft replying to thread `op`.
    #[must_use]
    pub fn new(op: ThreadId, author: Author) -> Self {
        Self { fsm: machine(), draft: Draft::new(op, author) }
    }

    #[must_use]
    pub fn state(&self) -> PostState {
        self.fsm.state()
    }

    /// Body as last sent to the server.
    #[must_use]
    pub fn body(&self) -> &str {
        &self.draft.body
    }

    #[must_use]
    pub fn id(&self) -> Option<PostId> {
        self.draft.id
    }

    #[must_use]
    pub fn op(&self) -> ThreadId {
        self.draft.op
    }

    #[must_use]
    pub fn nonce(&self) -> &str {
        &self.draft.nonce
    }

    #[must_use]
    pub fn editing(&self) -> bool {
        self.draft.editing
    }

    /// Drain the effects accumulated so far.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.draft.effects)
    }

    fn feed(&mut self, event: PostEvent, arg: Arg) {
        self.fsm.feed(&mut self.draft, event, arg);
    }

    /// The text field now holds `text`.
    pub fn input(&mut self, text: &str) {
        self.draft.last_linked = None;
        self.feed(PostEvent::Input, Arg::Text(text.to_owned()));
    }

    /// An upload finished and produced `token`.
    pub fn select_file(&mut self, token: &str) {
        self.feed(PostEvent::File, Arg::Token(token.to_owned()));
    }

    pub fn allocated(&mut self, id: PostId, op: ThreadId) {
        self.feed(PostEvent::Allocated, Arg::Post { id, op });
    }

    pub fn reclaim_failed(&mut self) {
        self.feed(PostEvent::ReclaimFailed, Arg::None);
    }

    pub fn disconnect(&mut self) {
        self.feed(PostEvent::Disconnect, Arg::None);
    }

    pub fn reconnect(&mut self) {
        self.feed(PostEvent::Reconnect, Arg::None);
    }

    pub fn require_captcha(&mut self) {
        self.feed(PostEvent::CaptchaRequired, Arg::None);
    }

    pub fn captcha_solved(&mut self) {
        self.feed(PostEvent::CaptchaSolved, Arg::None);
    }

    /// Finish the post. Terminal.
    pub fn finalize(&mut self) {
        self.feed(PostEvent::Finalize, Arg::None);
    }

    /// Route a server event addressed to this connection.
    pub fn handle_event(&mut self, event: &Event) {
        match event {
            Event::PostId { id, op } => self.allocated(*id, *op),
            Event::Error { code, .. } if code == RECLAIM_FAILED => self.reclaim_failed(),
            _ => {}
        }
    }

    /// Insert a reference to post `id`, followed by the quoted `selection`.
    ///
    /// Before anything is allocated the quote is only buffered, so a post
    /// is never created holding nothing but a quote.
    pub fn quote(&mut self, id: PostId, selection: &str) {
        if !self.draft.editing {
            return;
        }
        let old = match &self.draft.buffered_text {
            Some(text) if !text.is_empty() => text.clone(),
            _ => self.draft.body.clone(),
        };
        let already_linked = self.draft.last_linked == Some(id);
        let text = old.clone() + &quote::reference(&old, id, selection, already_linked);
        self.draft.last_linked = Some(id);

        let commit = self.draft.alloc_requested
            || self.draft.buffered_text.as_deref().is_some_and(|t| !t.is_empty());
        self.draft
            .effects
            .push(Effect::ReplaceText { text: text.clone(), commit });
        if commit {
            self.feed(PostEvent::Input, Arg::Text(text));
        } else {
            self.draft.buffer_text(text);
        }
    }
}

#[cfg(test)]
#[path = "composer_test.rs"]
mod tests;
