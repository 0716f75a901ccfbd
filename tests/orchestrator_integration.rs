//! Integration tests for the orchestrator, poll loop, and question flow,
//! driven by a scripted in-memory backend.

mod common;

use a3s_remote::backend::CliBackend;
use a3s_remote::{
    AgentEvent, AnswerChoice, BackendKind, BackendSet, ChannelSink, ConversationIdentity,
    Dispatch, ErrorKind, EventSink, InboundEvent, Orchestrator, OutboundEvent, SessionRegistry,
    StaticCatalog, SubagentDef,
};
use async_trait::async_trait;
use common::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn slack(thread: &str) -> ConversationIdentity {
    ConversationIdentity::new("slack", "C024BE91L", "U1").with_thread(thread)
}

fn outcomes(events: &[AgentEvent]) -> usize {
    events.iter().filter(|e| e.is_outcome()).count()
}

// ─── Turn Lifecycle ──────────────────────────────────────────────

#[tokio::test]
async fn test_immediate_completion_emits_one_result() {
    let mut h = harness(Script {
        initial: vec![finished("msg_1", "Dark mode added")],
        ..Default::default()
    });
    let who = slack("t1");

    let dispatch = h.orchestrator.handle(InboundEvent::new(who.clone(), "add dark mode")).await;
    assert_eq!(dispatch, Dispatch::Started(BackendKind::OpenCode));

    let events = recv_outcome(&mut h.events).await;
    assert_eq!(outcomes(&events), 1);
    assert!(events.contains(&AgentEvent::SessionStarted {
        backend: BackendKind::OpenCode,
        session_id: "ses_1".into(),
    }));
    assert_eq!(
        events.last().unwrap(),
        &AgentEvent::Result {
            text: "Dark mode added".into()
        }
    );

    settle(&h.orchestrator, &who).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.events.try_recv().is_err());

    let starts = h.backend.starts();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].prompt, "add dark mode");
}

#[tokio::test]
async fn test_second_turn_continues_backend_session() {
    let mut h = harness(Script {
        initial: vec![finished("msg_1", "done")],
        ..Default::default()
    });
    let who = slack("t1");

    h.orchestrator.handle(InboundEvent::new(who.clone(), "first")).await;
    recv_outcome(&mut h.events).await;
    settle(&h.orchestrator, &who).await;

    h.orchestrator.handle(InboundEvent::new(who.clone(), "second")).await;
    let events = recv_outcome(&mut h.events).await;
    assert!(!events
        .iter()
        .any(|e| matches!(e, AgentEvent::SessionStarted { .. })));

    let starts = h.backend.starts();
    assert_eq!(starts[0].prior_session, None);
    assert_eq!(starts[1].prior_session.as_deref(), Some("ses_1"));
}

// ─── Questions ───────────────────────────────────────────────────

#[tokio::test]
async fn test_question_answer_resumes_loop() {
    let mut h = harness(Script {
        initial: vec![
            text("msg_0", "Checking the build"),
            question("call_1", "Proceed?", &["yes", "no"]),
        ],
        after_answer: vec![finished("msg_2", "Shipped")],
        ..Default::default()
    });
    let who = slack("t1");

    h.orchestrator.handle(InboundEvent::new(who.clone(), "deploy")).await;
    let before = recv_question(&mut h.events).await;
    let prompt = match before.last().unwrap() {
        AgentEvent::Question(p) => p.clone(),
        other => panic!("expected question, got {:?}", other),
    };
    assert_eq!(prompt.correlation_id, "call_1");
    assert_eq!(prompt.options.len(), 2);
    assert!(h.orchestrator.coordinator().pending(&who.base_session_key()).is_some());

    let dispatch = h
        .orchestrator
        .handle(InboundEvent::answer(who.clone(), "call_1", AnswerChoice::Option(1)))
        .await;
    assert_eq!(dispatch, Dispatch::Answered);

    let after = recv_outcome(&mut h.events).await;
    assert_eq!(after.last().unwrap(), &AgentEvent::Result { text: "Shipped".into() });

    // Re-polls after the answer return earlier items again; none are re-emitted
    let all: Vec<_> = before.iter().chain(after.iter()).collect();
    let texts = all
        .iter()
        .filter(|e| matches!(e, AgentEvent::AssistantText { .. }))
        .count();
    let questions = all.iter().filter(|e| matches!(e, AgentEvent::Question(_))).count();
    assert_eq!(texts, 1);
    assert_eq!(questions, 1);
    assert_eq!(h.backend.answers(), vec![("call_1".to_string(), "yes".to_string())]);
}

#[tokio::test]
async fn test_typed_text_answers_pending_question() {
    let mut h = harness(Script {
        initial: vec![question("call_1", "Which branch?", &["main", "dev"])],
        after_answer: vec![finished("msg_2", "ok")],
        ..Default::default()
    });
    let who = slack("t1");

    h.orchestrator.handle(InboundEvent::new(who.clone(), "merge it")).await;
    recv_question(&mut h.events).await;

    let dispatch = h.orchestrator.handle(InboundEvent::new(who.clone(), "release/2.1")).await;
    assert_eq!(dispatch, Dispatch::Answered);
    recv_outcome(&mut h.events).await;
    assert_eq!(
        h.backend.answers(),
        vec![("call_1".to_string(), "release/2.1".to_string())]
    );
}

#[tokio::test]
async fn test_invalid_option_is_ignored() {
    let mut h = harness(Script {
        initial: vec![question("call_1", "Proceed?", &["yes", "no"])],
        after_answer: vec![finished("msg_2", "ok")],
        ..Default::default()
    });
    let who = slack("t1");

    h.orchestrator.handle(InboundEvent::new(who.clone(), "go")).await;
    recv_question(&mut h.events).await;

    let dispatch = h
        .orchestrator
        .handle(InboundEvent::answer(who.clone(), "call_1", AnswerChoice::Option(7)))
        .await;
    assert_eq!(dispatch, Dispatch::AnswerIgnored);
    assert!(h.backend.answers().is_empty());
    assert!(h.orchestrator.coordinator().pending(&who.base_session_key()).is_some());

    h.orchestrator.stop(&who).await;
    recv_outcome(&mut h.events).await;
}

#[tokio::test(start_paused = true)]
async fn test_question_timeout_then_late_answer_is_noop() {
    let mut h = harness(Script {
        initial: vec![question("call_1", "Proceed?", &["yes", "no"])],
        after_answer: vec![finished("msg_2", "too late")],
        ..Default::default()
    });
    let who = slack("t1");

    h.orchestrator.handle(InboundEvent::new(who.clone(), "deploy")).await;
    recv_question(&mut h.events).await;

    let events = recv_outcome(&mut h.events).await;
    assert_eq!(outcomes(&events), 1);
    assert!(matches!(
        events.last().unwrap(),
        AgentEvent::QuestionTimedOut { correlation_id, .. } if correlation_id == "call_1"
    ));
    settle(&h.orchestrator, &who).await;

    let key = who.base_session_key();
    assert!(h.orchestrator.coordinator().is_timed_out(&key, "call_1"));

    let dispatch = h
        .orchestrator
        .handle(InboundEvent::answer(who.clone(), "call_1", AnswerChoice::Option(1)))
        .await;
    assert_eq!(dispatch, Dispatch::AnswerIgnored);
    assert!(h.backend.answers().is_empty());
    assert!(!h.orchestrator.is_active(&who));
}

#[tokio::test]
async fn test_rejected_answer_releases_loop() {
    let mut h = harness(Script {
        initial: vec![question("call_1", "Proceed?", &["yes", "no"])],
        reject_answers: true,
        ..Default::default()
    });
    let who = slack("t1");

    h.orchestrator.handle(InboundEvent::new(who.clone(), "deploy")).await;
    recv_question(&mut h.events).await;

    let dispatch = h
        .orchestrator
        .handle(InboundEvent::answer(who.clone(), "call_1", AnswerChoice::Option(2)))
        .await;
    assert_eq!(dispatch, Dispatch::AnswerFailed);

    let events = recv_outcome(&mut h.events).await;
    assert_eq!(outcomes(&events), 1);
    assert!(matches!(
        events.last().unwrap(),
        AgentEvent::Error { kind: ErrorKind::Submission, .. }
    ));
    settle(&h.orchestrator, &who).await;
    assert_eq!(h.backend.interrupts(), 1);
}

#[tokio::test]
async fn test_sessions_wait_independently() {
    let mut h = harness(Script {
        initial: vec![question("call_1", "Proceed?", &["yes", "no"])],
        after_answer: vec![finished("msg_2", "ok")],
        ..Default::default()
    });
    let alice = slack("t-alice");
    let bob = slack("t-bob");

    h.orchestrator.handle(InboundEvent::new(alice.clone(), "task a")).await;
    h.orchestrator.handle(InboundEvent::new(bob.clone(), "task b")).await;

    let mut asked = 0;
    while asked < 2 {
        let ev = h.events.recv().await.unwrap();
        if matches!(ev.event, AgentEvent::Question(_)) {
            asked += 1;
        }
    }

    let coordinator = h.orchestrator.coordinator().clone();
    assert!(coordinator.pending(&alice.base_session_key()).is_some());
    assert!(coordinator.pending(&bob.base_session_key()).is_some());

    let dispatch = h
        .orchestrator
        .handle(InboundEvent::answer(alice.clone(), "call_1", AnswerChoice::Option(1)))
        .await;
    assert_eq!(dispatch, Dispatch::Answered);

    let done = recv_outcome(&mut h.events).await;
    assert!(matches!(done.last().unwrap(), AgentEvent::Result { .. }));
    settle(&h.orchestrator, &alice).await;

    assert!(coordinator.pending(&bob.base_session_key()).is_some());
    assert!(h.orchestrator.is_active(&bob));

    h.orchestrator.stop(&bob).await;
    let stopped = recv_outcome(&mut h.events).await;
    assert!(matches!(stopped.last().unwrap(), AgentEvent::Cancelled { .. }));
}

/// Forwards events and clicks the first option the moment a question is shown.
struct InstantAnswerSink {
    forward: ChannelSink,
    orchestrator: Arc<Mutex<Option<Orchestrator>>>,
}

#[async_trait]
impl EventSink for InstantAnswerSink {
    async fn emit(&self, event: OutboundEvent) {
        let asked = match &event.event {
            AgentEvent::Question(prompt) => Some(prompt.correlation_id.clone()),
            _ => None,
        };
        let identity = event.identity.clone();
        self.forward.emit(event).await;

        let Some(correlation_id) = asked else {
            return;
        };
        let orchestrator = self.orchestrator.lock().unwrap().clone();
        if let Some(orchestrator) = orchestrator {
            let dispatch = orchestrator
                .handle(InboundEvent::answer(
                    identity.clone(),
                    correlation_id,
                    AnswerChoice::Option(1),
                ))
                .await;
            self.forward
                .emit(OutboundEvent {
                    identity,
                    event: AgentEvent::notice(format!("{:?}", dispatch)),
                })
                .await;
        }
    }
}

#[tokio::test]
async fn test_answer_while_question_is_being_shown() {
    let backend = ScriptedBackend::new(
        BackendKind::OpenCode,
        Script {
            initial: vec![question("call_1", "Proceed?", &["yes", "no"])],
            after_answer: vec![finished("msg_2", "Shipped")],
            ..Default::default()
        },
    );
    let (forward, mut events) = ChannelSink::new();
    let slot = Arc::new(Mutex::new(None));
    let orchestrator = Orchestrator::new(
        test_config(),
        BackendSet::new().with(backend.clone()),
        Arc::new(SessionRegistry::in_memory()),
        Arc::new(StaticCatalog::new()),
        Arc::new(InstantAnswerSink {
            forward,
            orchestrator: slot.clone(),
        }),
    );
    *slot.lock().unwrap() = Some(orchestrator.clone());
    let who = slack("t1");

    orchestrator.handle(InboundEvent::new(who.clone(), "deploy")).await;
    let seen = tokio::time::timeout(Duration::from_secs(5), recv_outcome(&mut events))
        .await
        .expect("answer given during display was lost");

    assert!(seen.contains(&AgentEvent::notice("Answered")));
    assert_eq!(seen.last().unwrap(), &AgentEvent::Result { text: "Shipped".into() });
    assert_eq!(backend.answers(), vec![("call_1".to_string(), "yes".to_string())]);
    settle(&orchestrator, &who).await;
}

// ─── Concurrency & Commands ──────────────────────────────────────

#[tokio::test]
async fn test_one_active_loop_per_conversation() {
    let mut h = harness(Script::default());
    let who = slack("t1");

    let dispatches = futures::future::join_all(
        (0..8).map(|i| h.orchestrator.handle(InboundEvent::new(who.clone(), format!("job {}", i)))),
    )
    .await;

    let started = dispatches
        .iter()
        .filter(|d| matches!(d, Dispatch::Started(_)))
        .count();
    let busy = dispatches.iter().filter(|d| **d == Dispatch::Busy).count();
    assert_eq!(started, 1);
    assert_eq!(busy, 7);
    assert_eq!(h.orchestrator.active_count(), 1);

    assert_eq!(h.orchestrator.stop(&who).await, Dispatch::Stopped);
    let events = recv_outcome(&mut h.events).await;
    assert_eq!(events.iter().filter(|e| matches!(e, AgentEvent::Notice { .. })).count(), 7);
    settle(&h.orchestrator, &who).await;
}

#[tokio::test]
async fn test_stop_command_cancels_running_turn() {
    let mut h = harness(Script {
        initial: vec![text("msg_0", "working")],
        ..Default::default()
    });
    let who = slack("t1");

    h.orchestrator.handle(InboundEvent::new(who.clone(), "long job")).await;
    recv_until(&mut h.events, |e| matches!(e, AgentEvent::AssistantText { .. })).await;

    let dispatch = h.orchestrator.handle(InboundEvent::new(who.clone(), "/stop")).await;
    assert_eq!(dispatch, Dispatch::Stopped);

    let events = recv_outcome(&mut h.events).await;
    assert_eq!(
        events.last().unwrap(),
        &AgentEvent::Cancelled {
            text: "Terminated execution.".into()
        }
    );
    settle(&h.orchestrator, &who).await;
    assert_eq!(h.backend.interrupts(), 1);

    let again = h.orchestrator.handle(InboundEvent::new(who.clone(), "/stop")).await;
    assert_eq!(again, Dispatch::NothingToStop);
}

#[tokio::test]
async fn test_stop_while_awaiting_answer() {
    let mut h = harness(Script {
        initial: vec![question("call_1", "Proceed?", &["yes", "no"])],
        ..Default::default()
    });
    let who = slack("t1");

    h.orchestrator.handle(InboundEvent::new(who.clone(), "deploy")).await;
    recv_question(&mut h.events).await;

    h.orchestrator.stop(&who).await;
    let events = recv_outcome(&mut h.events).await;
    assert!(matches!(events.last().unwrap(), AgentEvent::Cancelled { .. }));
    settle(&h.orchestrator, &who).await;
    assert!(h.orchestrator.coordinator().pending(&who.base_session_key()).is_none());
}

#[tokio::test]
async fn test_reset_forgets_sessions() {
    let mut h = harness(Script {
        initial: vec![finished("msg_1", "done")],
        ..Default::default()
    });
    let who = slack("t1");

    h.orchestrator.handle(InboundEvent::new(who.clone(), "hello")).await;
    recv_outcome(&mut h.events).await;
    settle(&h.orchestrator, &who).await;
    assert_eq!(h.registry.list(&who.base_session_key()).await.unwrap().len(), 1);

    let dispatch = h.orchestrator.handle(InboundEvent::new(who.clone(), "/reset")).await;
    assert_eq!(dispatch, Dispatch::Reset(1));
    assert!(h.registry.list(&who.base_session_key()).await.unwrap().is_empty());

    h.orchestrator.handle(InboundEvent::new(who.clone(), "again")).await;
    recv_outcome(&mut h.events).await;
    assert_eq!(h.backend.starts()[1].prior_session, None);
}

// ─── Failures ────────────────────────────────────────────────────

#[tokio::test]
async fn test_transient_poll_failures_recover() {
    let mut h = harness(Script {
        initial: vec![finished("msg_1", "done")],
        failing_polls: 2,
        ..Default::default()
    });
    let who = slack("t1");

    h.orchestrator.handle(InboundEvent::new(who.clone(), "go")).await;
    let events = recv_outcome(&mut h.events).await;
    assert_eq!(events.last().unwrap(), &AgentEvent::Result { text: "done".into() });
}

#[tokio::test]
async fn test_persistent_poll_failures_report_crash() {
    let mut h = harness(Script {
        initial: vec![finished("msg_1", "never seen")],
        failing_polls: 1000,
        ..Default::default()
    });
    let who = slack("t1");

    h.orchestrator.handle(InboundEvent::new(who.clone(), "go")).await;
    let events = recv_outcome(&mut h.events).await;
    assert_eq!(outcomes(&events), 1);
    assert!(matches!(
        events.last().unwrap(),
        AgentEvent::Error { kind: ErrorKind::BackendCrash, .. }
    ));
    settle(&h.orchestrator, &who).await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_cli_crash_reports_real_reason_at_once() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::TempDir::new().unwrap();
    let script = tmp.path().join("fake-claude");
    std::fs::write(&script, "#!/bin/sh\necho 'quota exceeded: real reason' >&2\nexit 3\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = test_config();
    config.default_working_dir = Some(tmp.path().to_path_buf());
    config.platform_backends.insert("slack".into(), "claude".into());
    config.poll.max_consecutive_poll_failures = 30;
    config.poll.interval_ms = 200;

    let claude = CliBackend::new(BackendKind::Claude, Some(script.to_string_lossy().into_owned())).unwrap();
    let (sink, mut events) = ChannelSink::new();
    let orchestrator = Orchestrator::new(
        config,
        BackendSet::new().with(Arc::new(claude)),
        Arc::new(SessionRegistry::in_memory()),
        Arc::new(StaticCatalog::new()),
        Arc::new(sink),
    );
    let who = slack("t1");

    let dispatch = orchestrator.handle(InboundEvent::new(who.clone(), "hi")).await;
    assert_eq!(dispatch, Dispatch::Started(BackendKind::Claude));

    // well under 30 polls at 200ms
    let seen = tokio::time::timeout(Duration::from_secs(3), recv_outcome(&mut events))
        .await
        .expect("crash not reported promptly");
    assert_eq!(outcomes(&seen), 1);
    match seen.last().unwrap() {
        AgentEvent::Error {
            kind: ErrorKind::BackendCrash,
            message,
        } => assert!(message.contains("quota exceeded: real reason"), "{}", message),
        other => panic!("expected crash error, got {:?}", other),
    }
    settle(&orchestrator, &who).await;
}

#[tokio::test]
async fn test_unconfigured_backend_reports_error() {
    let mut config = test_config();
    config.platform_backends.insert("slack".into(), "claude".into());
    let mut h = harness_with(
        config,
        Script::default(),
        StaticCatalog::new(),
        Arc::new(SessionRegistry::in_memory()),
    );
    let who = slack("t1");

    let dispatch = h.orchestrator.handle(InboundEvent::new(who.clone(), "hi")).await;
    assert_eq!(dispatch, Dispatch::Started(BackendKind::Claude));
    let events = recv_outcome(&mut h.events).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        AgentEvent::Error { kind: ErrorKind::BackendUnavailable, .. }
    ));
    settle(&h.orchestrator, &who).await;
}

#[tokio::test]
async fn test_disabled_backend_fails_routing() {
    let mut config = test_config();
    config.opencode.enabled = false;
    let mut h = harness_with(
        config,
        Script::default(),
        StaticCatalog::new(),
        Arc::new(SessionRegistry::in_memory()),
    );
    let who = slack("t1");

    let dispatch = h.orchestrator.handle(InboundEvent::new(who.clone(), "hi")).await;
    assert_eq!(dispatch, Dispatch::RoutingFailed);
    let ev = h.events.recv().await.unwrap();
    assert!(matches!(ev.event, AgentEvent::Error { kind: ErrorKind::Routing, .. }));
    assert!(!h.orchestrator.is_active(&who));
}

// ─── Subagent Prefixes ───────────────────────────────────────────

#[tokio::test]
async fn test_subagent_prefix_forces_subagent() {
    let catalog = StaticCatalog::new().with(
        BackendKind::OpenCode,
        SubagentDef::new("Plan").with_model("anthropic/claude-opus-4"),
    );
    let mut h = harness_with(
        test_config(),
        Script {
            initial: vec![finished("msg_1", "1. do it")],
            ..Default::default()
        },
        catalog,
        Arc::new(SessionRegistry::in_memory()),
    );
    let who = slack("t1");

    h.orchestrator.handle(InboundEvent::new(who.clone(), "Plan: outline steps")).await;
    let events = recv_outcome(&mut h.events).await;
    assert_eq!(
        events[0],
        AgentEvent::Acknowledged {
            subagent: "Plan".into()
        }
    );
    settle(&h.orchestrator, &who).await;

    h.orchestrator.handle(InboundEvent::new(who.clone(), "Unknownthing: hi")).await;
    let plain = recv_outcome(&mut h.events).await;
    assert!(!plain
        .iter()
        .any(|e| matches!(e, AgentEvent::Acknowledged { .. } | AgentEvent::Error { .. })));

    let starts = h.backend.starts();
    assert_eq!(starts[0].prompt, "outline steps");
    assert_eq!(starts[0].options.subagent.as_deref(), Some("Plan"));
    assert_eq!(starts[0].options.model.as_deref(), Some("anthropic/claude-opus-4"));
    assert_eq!(starts[1].prompt, "Unknownthing: hi");
    assert_eq!(starts[1].options.subagent, None);
}
