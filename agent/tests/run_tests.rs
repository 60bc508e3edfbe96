use std::sync::{Arc, Mutex};
use std::time::Duration;

use deepsearch_agent::testing::{hit, MockScraper, MockSearchProvider};
use deepsearch_agent::{
    ActionType, AgentConfig, AgentError, ChatMessage, EventWriter, MemoryKv, OnFinish,
    RequestUser, RunSession, RunSessionParams, SearchStatus, StreamEvent, SystemContext,
};
use deepsearch_llm::llm_test::MockLanguageModel;

const ALLOW: &str = r#"{"classification":"allow"}"#;
const EVAL_ANSWER: &str =
    r#"{"type":"answer","title":"Ready","reasoning":"Covered","feedback":"No caveats"}"#;
const EVAL_CONTINUE: &str =
    r#"{"type":"continue","title":"Keep going","reasoning":"Gaps remain","feedback":"Cover recent data"}"#;

fn config(max_steps: usize) -> AgentConfig {
    AgentConfig {
        max_steps,
        search_results_count: 3,
        request_timeout: Duration::from_secs(5),
        ..AgentConfig::default()
    }
}

struct Harness {
    model: Arc<MockLanguageModel>,
    search: Arc<MockSearchProvider>,
    scraper: Arc<MockScraper>,
    session: RunSession,
}

fn harness(max_steps: usize) -> Harness {
    let model = Arc::new(MockLanguageModel::new());
    let search = Arc::new(MockSearchProvider::new());
    let scraper = Arc::new(MockScraper::new());

    let session = RunSession::new(RunSessionParams {
        config: config(max_steps),
        model: model.clone(),
        search: search.clone(),
        scraper: scraper.clone(),
        kv: Arc::new(MemoryKv::new()),
    });

    Harness {
        model,
        search,
        scraper,
        session,
    }
}

fn question(text: &str) -> SystemContext {
    SystemContext::new(vec![ChatMessage::user(text)], String::new())
}

/// Run the session to completion and collect every emitted event plus the
/// text handed to the finish sink.
async fn run_collect(harness: &Harness, ctx: SystemContext) -> (Vec<StreamEvent>, Option<String>) {
    let (writer, mut rx) = EventWriter::channel(256);
    let finished: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let finished_clone = finished.clone();

    let on_finish: OnFinish = Box::new(move |text: String| {
        let finished = finished_clone.clone();
        Box::pin(async move {
            *finished.lock().unwrap() = Some(text);
        })
    });

    let run = harness.session.run(ctx, writer, Some(on_finish));

    let collect = async {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    };

    let (_, events) = tokio::join!(run, collect);
    let text = finished.lock().unwrap().clone();
    (events, text)
}

fn count_tag(events: &[StreamEvent], f: impl Fn(&StreamEvent) -> bool) -> usize {
    events.iter().filter(|e| f(e)).count()
}

fn position(events: &[StreamEvent], f: impl Fn(&StreamEvent) -> bool) -> usize {
    events
        .iter()
        .position(f)
        .unwrap_or_else(|| panic!("expected event not found"))
}

#[tokio::test]
async fn happy_path_single_step() {
    let h = harness(3);

    h.model.enqueue_generate_text(ALLOW);
    h.model.enqueue_generate_text(
        r#"{"plan":"Establish the capital and corroborate it.",
            "queries":["capital of France","France government seat","Paris overview"]}"#,
    );

    let queries = ["capital of France", "France government seat", "Paris overview"];
    for (qi, query) in queries.iter().enumerate() {
        let hits = (0..3)
            .map(|i| {
                hit(
                    &format!("https://example.org/{qi}/{i}"),
                    &format!("Result {qi}-{i}"),
                    "Paris is the capital of France.",
                )
            })
            .collect();
        h.search.script(query, hits);
        for i in 0..3 {
            h.scraper.script(
                &format!("https://example.org/{qi}/{i}"),
                "Paris has been the capital of France since 987.",
            );
        }
    }

    for _ in 0..9 {
        h.model.enqueue_generate_text("Synthesized evidence about Paris.");
    }
    h.model.enqueue_generate_text(EVAL_ANSWER);
    h.model.enqueue_stream_text([
        "The capital of France is Paris ",
        "([Wikipedia](https://en.wikipedia.org/wiki/Paris)).",
    ]);

    let (events, finished) = run_collect(&h, question("What is the capital of France?")).await;

    assert_eq!(
        count_tag(&events, |e| matches!(e, StreamEvent::Planning { .. })),
        1
    );
    assert_eq!(
        count_tag(&events, |e| matches!(e, StreamEvent::QueriesGenerated { .. })),
        1
    );
    assert_eq!(
        count_tag(&events, |e| matches!(
            e,
            StreamEvent::SearchUpdate {
                status: SearchStatus::Completed,
                ..
            }
        )),
        3
    );
    assert_eq!(
        count_tag(&events, |e| matches!(e, StreamEvent::SourcesFound { .. })),
        1
    );

    let action_index = position(&events, |e| matches!(e, StreamEvent::NewAction { .. }));
    match &events[action_index] {
        StreamEvent::NewAction { action } => {
            assert_eq!(action.action_type(), ActionType::Answer);
        }
        _ => unreachable!(),
    }
    assert_eq!(
        count_tag(&events, |e| matches!(e, StreamEvent::EvaluatorFeedback { .. })),
        1
    );

    // Ordering anchors for the step.
    let planning = position(&events, |e| matches!(e, StreamEvent::Planning { .. }));
    let generated = position(&events, |e| matches!(e, StreamEvent::QueriesGenerated { .. }));
    let sources = position(&events, |e| matches!(e, StreamEvent::SourcesFound { .. }));
    let feedback = position(&events, |e| matches!(e, StreamEvent::EvaluatorFeedback { .. }));
    let first_delta = position(&events, |e| matches!(e, StreamEvent::TextDelta { .. }));
    assert!(planning < generated);
    assert!(generated < sources);
    assert!(sources < action_index);
    assert!(action_index < feedback);
    assert!(feedback < first_delta);
    let last_update = events
        .iter()
        .rposition(|e| matches!(e, StreamEvent::SearchUpdate { .. }))
        .unwrap();
    assert!(generated < last_update && last_update < sources);

    // All nine unique sources survive the dedup pass.
    match &events[sources] {
        StreamEvent::SourcesFound { sources, .. } => {
            assert_eq!(sources.len(), 9);
            assert!(sources.iter().all(|s| s.favicon.contains("example.org")));
        }
        _ => unreachable!(),
    }

    let deltas: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TextDelta { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert!(!deltas.is_empty());
    assert!(deltas.last().unwrap().contains("](https://"));

    assert_eq!(
        finished.as_deref(),
        Some("The capital of France is Paris ([Wikipedia](https://en.wikipedia.org/wiki/Paris)).")
    );
    assert_eq!(
        count_tag(&events, |e| matches!(e, StreamEvent::Error { .. })),
        0
    );
}

#[tokio::test]
async fn step_cap_forces_best_effort_final_answer() {
    let h = harness(2);

    let plan = r#"{"plan":"dig","queries":["q a","q b","q c"]}"#;
    h.model.enqueue_generate_text(ALLOW);
    // Step 0: plan, three summaries, continue.
    h.model.enqueue_generate_text(plan);
    for _ in 0..3 {
        h.model.enqueue_generate_text("Synthesized.");
    }
    h.model.enqueue_generate_text(EVAL_CONTINUE);
    // Step 1: same plan; every URL is already recorded, so no summaries run.
    h.model.enqueue_generate_text(plan);
    h.model.enqueue_generate_text(EVAL_CONTINUE);
    // Step budget exhausted: final answer.
    h.model
        .enqueue_stream_text(["Best effort: ", "see [source](https://example.org/0)."]);

    for (qi, query) in ["q a", "q b", "q c"].iter().enumerate() {
        let url = format!("https://example.org/{qi}");
        h.search.script(query, vec![hit(&url, "T", "S")]);
        h.scraper.script(&url, "Some page text.");
    }

    let (events, finished) = run_collect(&h, question("hard question")).await;

    assert_eq!(
        count_tag(&events, |e| matches!(e, StreamEvent::Planning { .. })),
        2
    );
    assert_eq!(
        count_tag(&events, |e| matches!(e, StreamEvent::ActionUpdate { .. })),
        2
    );
    assert!(finished.is_some());

    // The final answer ran with the incomplete-information prompt.
    let stream_inputs = h.model.tracked_stream_inputs();
    assert_eq!(stream_inputs.len(), 1);
    assert!(stream_inputs[0]
        .system_prompt
        .as_deref()
        .unwrap_or_default()
        .contains("may be incomplete"));

    // Each URL was scraped exactly once across both steps.
    let mut scraped = h.scraper.recorded_urls();
    scraped.sort();
    scraped.dedup();
    assert_eq!(scraped.len(), 3);
    assert_eq!(h.scraper.recorded_urls().len(), 3);
}

#[tokio::test]
async fn rate_limit_deny_emits_nothing() {
    let model = Arc::new(MockLanguageModel::new());
    let session = RunSession::new(RunSessionParams {
        config: AgentConfig {
            daily_request_limit: 1,
            ..config(3)
        },
        model,
        search: Arc::new(MockSearchProvider::new()),
        scraper: Arc::new(MockScraper::new()),
        kv: Arc::new(MemoryKv::new()),
    });

    let user = RequestUser { id: "u1".into() };
    assert!(session.admit(&user).await.is_ok());

    match session.admit(&user).await {
        Err(AgentError::Admission(decision)) => {
            assert!(!decision.allowed);
            assert_eq!(decision.remaining, 0);
            assert_eq!(decision.limit, 1);
        }
        other => panic!("expected admission denial, got {other:?}"),
    }
}

#[tokio::test]
async fn guardrail_refusal_bypasses_the_loop() {
    let h = harness(3);

    h.model
        .enqueue_generate_text(r#"{"classification":"refuse","reason":"harmful request"}"#);
    h.model
        .enqueue_stream_text(["I can't help with that request."]);

    let (events, finished) = run_collect(&h, question("do something harmful")).await;

    assert_eq!(
        count_tag(&events, |e| matches!(e, StreamEvent::Planning { .. })),
        0
    );
    assert!(events
        .iter()
        .all(|e| matches!(e, StreamEvent::TextDelta { .. })));
    assert_eq!(finished.as_deref(), Some("I can't help with that request."));
    assert!(h.search.recorded_queries().is_empty());
}

#[tokio::test]
async fn partial_fanout_failure_is_contained() {
    let h = harness(3);

    h.model.enqueue_generate_text(ALLOW);
    h.model
        .enqueue_generate_text(r#"{"plan":"p","queries":["q0","q1","q2"]}"#);

    h.search
        .script("q0", vec![hit("https://a.example/0", "A", "sa")]);
    h.search.script_error("q1", "provider 500");
    h.search
        .script("q2", vec![hit("https://c.example/2", "C", "sc")]);
    h.scraper.script("https://a.example/0", "content a");
    h.scraper.script("https://c.example/2", "content c");

    for _ in 0..2 {
        h.model.enqueue_generate_text("Synthesized.");
    }
    h.model.enqueue_generate_text(EVAL_ANSWER);
    h.model
        .enqueue_stream_text(["Answer with [link](https://a.example/0)."]);

    let (events, _) = run_collect(&h, question("q")).await;

    let failed: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::SearchUpdate {
                query_index,
                status: SearchStatus::Error,
                error,
                ..
            } => Some((*query_index, error.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, 1);
    assert!(failed[0].1.is_some());

    assert_eq!(
        count_tag(&events, |e| matches!(
            e,
            StreamEvent::SearchUpdate {
                status: SearchStatus::Completed,
                ..
            }
        )),
        2
    );

    match events
        .iter()
        .find(|e| matches!(e, StreamEvent::SourcesFound { .. }))
        .unwrap()
    {
        StreamEvent::SourcesFound { sources, .. } => {
            let urls: Vec<_> = sources.iter().map(|s| s.url.as_str()).collect();
            assert_eq!(urls, vec!["https://a.example/0", "https://c.example/2"]);
        }
        _ => unreachable!(),
    }

    assert_eq!(
        count_tag(&events, |e| matches!(e, StreamEvent::NewAction { .. })),
        1
    );
}

#[tokio::test]
async fn zero_step_budget_answers_immediately() {
    let h = harness(0);

    h.model.enqueue_generate_text(ALLOW);
    h.model.enqueue_stream_text(["Direct best-effort answer."]);

    let (events, finished) = run_collect(&h, question("q")).await;

    assert_eq!(
        count_tag(&events, |e| matches!(e, StreamEvent::Planning { .. })),
        0
    );
    assert!(finished.is_some());

    let stream_inputs = h.model.tracked_stream_inputs();
    assert!(stream_inputs[0]
        .system_prompt
        .as_deref()
        .unwrap_or_default()
        .contains("may be incomplete"));
}

#[tokio::test]
async fn all_queries_failing_still_reaches_the_evaluator() {
    let h = harness(3);

    h.model.enqueue_generate_text(ALLOW);
    h.model
        .enqueue_generate_text(r#"{"plan":"p","queries":["q0","q1","q2"]}"#);
    h.search.script_error("q0", "down");
    h.search.script_error("q1", "down");
    h.search.script_error("q2", "down");
    h.model.enqueue_generate_text(EVAL_ANSWER);
    h.model.enqueue_stream_text(["Nothing found, but here goes."]);

    let (events, finished) = run_collect(&h, question("q")).await;

    assert_eq!(
        count_tag(&events, |e| matches!(
            e,
            StreamEvent::SearchUpdate {
                status: SearchStatus::Error,
                ..
            }
        )),
        3
    );
    match events
        .iter()
        .find(|e| matches!(e, StreamEvent::SourcesFound { .. }))
        .unwrap()
    {
        StreamEvent::SourcesFound { sources, .. } => assert!(sources.is_empty()),
        _ => unreachable!(),
    }
    assert_eq!(
        count_tag(&events, |e| matches!(e, StreamEvent::NewAction { .. })),
        1
    );
    assert!(finished.is_some());
}

#[tokio::test]
async fn rewriter_failure_falls_back_to_direct_query() {
    let h = harness(1);

    h.model.enqueue_generate_text(ALLOW);
    // Two schema-violating rewrites, then the fallback single query runs.
    h.model.enqueue_generate_text(r#"{"plan":"p","queries":["only"]}"#);
    h.model.enqueue_generate_text("not json at all");

    h.search.script(
        "what is rust",
        vec![hit("https://rust.example", "Rust", "A language")],
    );
    h.scraper.script("https://rust.example", "Rust is a language.");
    h.model.enqueue_generate_text("Synthesized.");
    h.model.enqueue_generate_text(EVAL_ANSWER);
    h.model
        .enqueue_stream_text(["Rust is [a language](https://rust.example)."]);

    let (events, finished) = run_collect(&h, question("what is rust")).await;

    match events
        .iter()
        .find(|e| matches!(e, StreamEvent::QueriesGenerated { .. }))
        .unwrap()
    {
        StreamEvent::QueriesGenerated { queries, .. } => {
            assert_eq!(queries, &vec!["what is rust".to_string()]);
        }
        _ => unreachable!(),
    }
    assert!(finished.is_some());
    assert_eq!(
        count_tag(&events, |e| matches!(e, StreamEvent::Error { .. })),
        0
    );
}

#[tokio::test]
async fn evaluator_failure_emits_error_then_best_effort_answer() {
    let h = harness(1);

    h.model.enqueue_generate_text(ALLOW);
    h.model
        .enqueue_generate_text(r#"{"plan":"p","queries":["q0","q1","q2"]}"#);
    h.search.script("q0", vec![hit("https://a.example", "A", "s")]);
    h.search.script("q1", vec![]);
    h.search.script("q2", vec![]);
    h.scraper.script("https://a.example", "text");
    h.model.enqueue_generate_text("Synthesized.");
    // Evaluator returns garbage twice.
    h.model.enqueue_generate_text("garbage");
    h.model.enqueue_generate_text("garbage again");
    h.model.enqueue_stream_text(["Partial [answer](https://a.example)."]);

    let (events, finished) = run_collect(&h, question("q")).await;

    assert_eq!(
        count_tag(&events, |e| matches!(e, StreamEvent::Error { .. })),
        1
    );
    assert!(finished.is_some());

    let error_index = position(&events, |e| matches!(e, StreamEvent::Error { .. }));
    let first_delta = position(&events, |e| matches!(e, StreamEvent::TextDelta { .. }));
    assert!(error_index < first_delta);
}
