use super::*;
use frames::Splice;
use proptest::prelude::*;

fn composer() -> Composer {
    Composer::new(1, Author::default())
}

fn sent(effects: &[Effect]) -> Vec<Command> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Send(cmd) => Some(cmd.clone()),
            _ => None,
        })
        .collect()
}

fn alloc_frag(effects: &[Effect]) -> Option<String> {
    sent(effects).into_iter().find_map(|cmd| match cmd {
        Command::InsertPost(req) => req.frag,
        _ => None,
    })
}

/// Composer that has allocated post 42 holding `body`.
fn live(body: &str) -> Composer {
    let mut c = composer();
    c.input(body);
    c.allocated(42, 1);
    c.take_effects();
    c
}

#[test]
fn first_input_requests_allocation() {
    let mut c = composer();
    c.input("h");

    let effects = c.take_effects();
    let mut expected = PostRequest::new(c.nonce());
    expected.frag = Some("h".into());
    expected.op = Some(1);
    assert_eq!(effects, vec![Effect::Send(Command::InsertPost(expected))]);
    assert_eq!(c.state(), PostState::PendingAllocation);
    assert_eq!(c.id(), None);
}

#[test]
fn whitespace_first_input_is_buffered() {
    let mut c = composer();
    c.input("  ");
    assert!(c.take_effects().is_empty());
    assert_eq!(c.state(), PostState::Idle);

    c.input("  a");
    assert_eq!(alloc_frag(&c.take_effects()).as_deref(), Some("  a"));
}

#[test]
fn edits_while_pending_are_sent_immediately() {
    let mut c = composer();
    c.input("h");
    c.take_effects();

    c.input("hi");
    assert_eq!(sent(&c.take_effects()), vec![Command::Append('i')]);
    assert_eq!(c.state(), PostState::PendingAllocation);
}

#[test]
fn duplicate_allocation_is_ignored() {
    let mut c = live("hi");
    assert_eq!(c.state(), PostState::Live);

    c.allocated(99, 1);
    assert_eq!(c.id(), Some(42));
    assert_eq!(c.body(), "hi");
    assert!(c.take_effects().is_empty());
}

#[test]
fn live_edits_use_the_minimal_message() {
    let mut c = live("hi");

    c.input("hi there");
    c.input("hi ther");
    c.input("ho ther");
    assert_eq!(
        sent(&c.take_effects()),
        vec![
            Command::Splice(Splice { start: 2, len: 0, text: " there".into() }),
            Command::Backspace,
            Command::Splice(Splice { start: 1, len: 1, text: "o".into() }),
        ]
    );
    assert_eq!(c.body(), "ho ther");
}

#[test]
fn repeated_identical_input_sends_nothing() {
    let mut c = live("hi");
    c.input("hi");
    assert!(c.take_effects().is_empty());
}

#[test]
fn body_is_capped_at_max_chars() {
    let base = "a".repeat(1999);
    let mut c = live(&base);

    c.input(&format!("{base}bcdef"));
    let effects = c.take_effects();
    assert_eq!(effects, vec![Effect::TrimInput(4), Effect::Send(Command::Append('b'))]);
    assert_eq!(char_count(c.body()), 2000);
}

#[test]
fn excess_lines_are_dropped() {
    let mut c = live("x");
    let text = vec!["x"; 103].join("\n");

    c.input(&text);
    let effects = c.take_effects();
    // Three dropped lines are three "\nx" pairs.
    assert_eq!(effects[0], Effect::TrimInput(6));
    assert_eq!(frames::limits::line_count(c.body()), 100);
}

#[test]
fn disconnect_buffers_and_reconnect_reclaims() {
    let mut c = live("hi");
    c.disconnect();
    assert_eq!(c.state(), PostState::Buffering);

    c.input("hi a");
    c.input("hi ab");
    assert!(c.take_effects().is_empty());

    c.reconnect();
    let nonce = c.nonce().to_owned();
    assert_eq!(sent(&c.take_effects()), vec![Command::ReclaimPost { nonce }]);
    assert_eq!(c.state(), PostState::PendingAllocation);

    // Input while the reclaim is outstanding stays buffered.
    c.input("hi abc");
    assert!(c.take_effects().is_empty());

    c.allocated(42, 1);
    assert_eq!(c.state(), PostState::Live);
    assert_eq!(
        sent(&c.take_effects()),
        vec![Command::Splice(Splice { start: 2, len: 0, text: " abc".into() })]
    );
    assert_eq!(c.id(), Some(42));
}

#[test]
fn failed_reclaim_reallocates_full_text() {
    let mut c = live("hi");
    let old_nonce = c.nonce().to_owned();
    c.disconnect();
    c.input("hi!");
    c.reconnect();
    c.take_effects();

    c.handle_event(&Event::Error { code: RECLAIM_FAILED.into(), message: "gone".into() });
    let effects = c.take_effects();
    assert_eq!(alloc_frag(&effects).as_deref(), Some("hi!"));
    assert_ne!(c.nonce(), old_nonce);
    assert_eq!(c.id(), None);
    assert_eq!(c.state(), PostState::PendingAllocation);

    c.handle_event(&Event::PostId { id: 77, op: 1 });
    assert_eq!(c.id(), Some(77));
}

#[test]
fn input_before_allocation_while_offline_allocates_once_on_reconnect() {
    let mut c = composer();
    c.disconnect();
    c.input("h");
    c.input("hello");
    assert!(c.take_effects().is_empty());

    c.reconnect();
    let effects = c.take_effects();
    assert_eq!(sent(&effects).len(), 1);
    assert_eq!(alloc_frag(&effects).as_deref(), Some("hello"));
}

#[test]
fn captcha_gate_buffers_until_solved() {
    let mut c = composer();
    c.require_captcha();
    c.input("x");
    assert!(c.take_effects().is_empty());
    assert_eq!(c.state(), PostState::Buffering);

    c.captcha_solved();
    assert_eq!(alloc_frag(&c.take_effects()).as_deref(), Some("x"));
}

#[test]
fn captcha_solved_while_offline_waits_for_reconnect() {
    let mut c = composer();
    c.require_captcha();
    c.disconnect();
    c.input("x");
    c.captcha_solved();
    assert!(c.take_effects().is_empty());

    c.reconnect();
    assert_eq!(alloc_frag(&c.take_effects()).as_deref(), Some("x"));
}

#[test]
fn finalize_sends_finish_and_closes() {
    let mut c = live("hi");
    c.finalize();

    assert_eq!(c.take_effects(), vec![Effect::Send(Command::FinishPost), Effect::Closed]);
    assert_eq!(c.state(), PostState::Closed);
    assert!(!c.editing());

    c.input("hi again");
    c.finalize();
    assert!(c.take_effects().is_empty());
}

#[test]
fn finalize_while_offline_completes_after_reclaim() {
    let mut c = live("hi");
    c.disconnect();
    c.input("hi!");
    c.finalize();
    assert!(c.take_effects().is_empty());
    assert_eq!(c.state(), PostState::Buffering);

    c.reconnect();
    c.take_effects();
    c.allocated(42, 1);
    assert_eq!(
        c.take_effects(),
        vec![
            Effect::Send(Command::Append('!')),
            Effect::Send(Command::FinishPost),
            Effect::Closed,
        ]
    );
    assert_eq!(c.state(), PostState::Closed);
}

#[test]
fn allocation_after_finalize_still_records_id() {
    let mut c = composer();
    c.input("hi");
    c.finalize();
    assert_eq!(c.state(), PostState::Closed);
    assert_eq!(c.id(), None);
    c.take_effects();

    c.allocated(42, 1);
    assert_eq!(c.state(), PostState::Closed);
    assert_eq!(c.id(), Some(42));
    assert!(c.take_effects().is_empty());

    c.allocated(43, 1);
    assert_eq!(c.id(), Some(42));
}

#[test]
fn finalize_idle_without_content_only_closes() {
    let mut c = composer();
    c.finalize();
    assert_eq!(c.take_effects(), vec![Effect::Closed]);
}

#[test]
fn disconnect_after_close_stays_closed() {
    let mut c = live("hi");
    c.finalize();
    c.take_effects();

    c.disconnect();
    assert_eq!(c.state(), PostState::Closed);
    assert!(c.take_effects().is_empty());
}

#[test]
fn file_allocates_with_buffered_text_and_attaches_once() {
    let mut c = composer();
    c.input(" ");
    c.select_file("tok1");

    let cmds = sent(&c.take_effects());
    let Command::InsertPost(req) = &cmds[0] else {
        panic!("expected allocation");
    };
    assert_eq!(req.image.as_deref(), Some("tok1"));
    assert_eq!(req.frag, None);

    c.allocated(42, 1);
    c.select_file("tok2");
    assert!(c.take_effects().is_empty());
}

#[test]
fn file_after_text_allocation_is_inserted() {
    let mut c = live("hi");
    c.select_file("tok");
    assert_eq!(sent(&c.take_effects()), vec![Command::InsertImage { token: "tok".into() }]);
}

#[test]
fn quote_before_allocation_is_only_buffered() {
    let mut c = composer();
    c.quote(12, "");

    assert_eq!(
        c.take_effects(),
        vec![Effect::ReplaceText { text: ">>12 \n".into(), commit: false }]
    );
    assert_eq!(c.state(), PostState::Idle);

    c.input(">>12 \nhey");
    assert_eq!(alloc_frag(&c.take_effects()).as_deref(), Some(">>12 \nhey"));
}

#[test]
fn consecutive_quotes_of_same_post_coalesce() {
    let mut c = live("hi");

    c.quote(5, "a");
    let first = c.take_effects();
    assert_eq!(first[0], Effect::ReplaceText { text: "hi\n>>5 \n>a\n".into(), commit: true });
    assert_eq!(c.body(), "hi\n>>5 \n>a\n");

    c.quote(5, "b");
    let second = c.take_effects();
    assert_eq!(second[0], Effect::ReplaceText { text: "hi\n>>5 \n>a\n>b\n".into(), commit: true });
}

#[test]
fn staff_credentials_ride_on_allocation() {
    let author = Author {
        name: Some("mod".into()),
        email: None,
        staff: Some(StaffCredentials { role: "moderator".into(), session: "tok".into() }),
    };
    let mut c = Composer::new(3, author);
    c.input("hello");

    let cmds = sent(&c.take_effects());
    let Command::InsertPost(req) = &cmds[0] else {
        panic!("expected allocation");
    };
    assert_eq!(req.auth.as_deref(), Some("moderator"));
    assert_eq!(req.session.as_deref(), Some("tok"));
    assert_eq!(req.name.as_deref(), Some("mod"));
    assert_eq!(req.op, Some(3));
}

#[test]
fn nonce_is_sixteen_random_bytes_in_hex() {
    let a = composer();
    let b = composer();
    assert_eq!(a.nonce().len(), 32);
    assert!(a.nonce().chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(a.nonce(), b.nonce());
}

/// Body a server would hold after applying `commands` in order.
fn replay(commands: &[Command]) -> String {
    let mut body = String::new();
    for cmd in commands {
        match cmd {
            Command::InsertPost(req) => body = req.frag.clone().unwrap_or_default(),
            Command::Append(c) => body.push(*c),
            Command::Backspace => {
                body.pop();
            }
            Command::Splice(splice) => body = splice.apply(&body),
            _ => {}
        }
    }
    body
}

proptest! {
    #[test]
    fn sent_edits_rebuild_the_body(
        inputs in prop::collection::vec("[ab é\n]{0,10}", 1..12),
        alloc_at in 0usize..12,
    ) {
        let mut c = composer();
        let mut commands = Vec::new();
        for (i, text) in inputs.iter().enumerate() {
            c.input(text);
            if i == alloc_at && c.state() == PostState::PendingAllocation {
                c.allocated(42, 1);
            }
            commands.extend(sent(&c.take_effects()));
        }
        prop_assert_eq!(replay(&commands), c.body());
    }
}
