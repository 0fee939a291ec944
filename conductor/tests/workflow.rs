//! End-to-end workflow tests against scratch git repositories.
//!
//! Every test drives `run_workflow` with scripted collaborators: the backend
//! writes files into the repository, the reviewer returns canned verdicts.

use std::time::Duration;

use conductor::core::types::{Phase, Verdict};
use conductor::events::Event;
use conductor::exit_codes;
use conductor::io::baseline::DirtyTreeError;
use conductor::io::config::{AttentionMode, EngineConfig, RetryConfig};
use conductor::parallel::OverlappingScopesError;
use conductor::planner::BackendPlanner;
use conductor::retry::RetryPolicy;
use conductor::review::{AttentionDecision, FixedDecider};
use conductor::test_support::{
    CollectingSink, ScriptedBackend, ScriptedReviewer, ScriptedStep, ScriptedTestRunner, TestRepo,
};
use conductor::workflow::{
    Collaborators, PhaseFailedError, RunSummary, StopReason, WorkflowInput, run_workflow,
};

const SCENARIO: &str = "\
- [ ] Parser core <!-- category: fundamental, order: 1, files: a.go -->
- [ ] HTTP handler <!-- category: independent, group: impl, files: b.go -->
- [ ] Handler tests <!-- category: independent, group: testing, files: b_test.go -->
";

fn config() -> EngineConfig {
    EngineConfig {
        max_parallel: 2,
        max_self_corrections: 0,
        max_autofix_attempts: 1,
        on_attention: AttentionMode::Stop,
        retry: RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn input(repo: &TestRepo, task_list: &str) -> WorkflowInput {
    WorkflowInput {
        workdir: repo.root().to_path_buf(),
        ticket: "T-1".to_string(),
        task_list: task_list.to_string(),
        plan: None,
    }
}

struct Doubles {
    backend: ScriptedBackend,
    tests: ScriptedTestRunner,
    reviewer: ScriptedReviewer,
    decider: FixedDecider,
    sink: CollectingSink,
}

impl Doubles {
    fn new(backend: ScriptedBackend, reviewer: ScriptedReviewer) -> Self {
        Self {
            backend,
            tests: ScriptedTestRunner::default(),
            reviewer,
            decider: FixedDecider(AttentionDecision::Stop),
            sink: CollectingSink::default(),
        }
    }

    fn collab(&self) -> Collaborators<'_> {
        Collaborators {
            backend: &self.backend,
            tests: &self.tests,
            reviewer: &self.reviewer,
            decider: &self.decider,
            planner: None,
            events: &self.sink,
        }
    }

    fn run(&self, config: &EngineConfig, input: &WorkflowInput) -> RunSummary {
        run_workflow(config, &self.collab(), input).expect("workflow")
    }
}

fn scenario_backend() -> ScriptedBackend {
    ScriptedBackend::new()
        .script(
            "Parser core",
            vec![ScriptedStep::ok("done").write("a.go", "package a\n")],
        )
        .script(
            "HTTP handler",
            vec![ScriptedStep::ok("done").write("b.go", "package b\n")],
        )
        .script(
            "Handler tests",
            vec![ScriptedStep::ok("done").write("b_test.go", "package b\n\n// tests\n")],
        )
}

#[test]
fn scenario_sequential_then_parallel_ends_with_pass() {
    let repo = TestRepo::new().expect("repo");
    let start = repo.head().expect("head");
    let doubles = Doubles::new(scenario_backend(), ScriptedReviewer::new());

    let summary = doubles.run(&config(), &input(&repo, SCENARIO));

    assert_eq!(summary.exit_code(), exit_codes::OK);
    assert_eq!(summary.baseline, start);
    assert_eq!(summary.completed.len(), 3);
    assert!(summary.completed.iter().all(|t| t.checkpoint.is_some()));
    assert!(summary.failed.is_empty());
    assert_eq!(summary.final_verdict, Some(Verdict::Pass));
    assert!(!summary.replan_triggered);

    let subjects = repo.subjects_since(&start).expect("log");
    assert_eq!(subjects.len(), 3);
    assert_eq!(subjects[0], "conductor: Parser core");
    let mut parallel = subjects[1..].to_vec();
    parallel.sort();
    assert_eq!(
        parallel,
        vec!["conductor: HTTP handler", "conductor: Handler tests"]
    );
    assert_eq!(repo.status().expect("status"), "");

    let labels: Vec<String> = doubles.reviewer.calls().into_iter().map(|c| c.label).collect();
    assert_eq!(labels, vec!["phase 1 (sequential)", "phase 2 (parallel)"]);

    let events = doubles.sink.events();
    assert!(events.contains(&Event::PhaseStarted {
        phase: Phase::Parallel,
        tasks: 2
    }));
    let summary_path = repo
        .root()
        .join(".conductor/runs/t-1")
        .join(&summary.run_id)
        .join("summary.json");
    assert!(summary_path.exists());
}

#[test]
fn final_diff_is_union_of_checkpoint_diffs() {
    let repo = TestRepo::new().expect("repo");
    let doubles = Doubles::new(scenario_backend(), ScriptedReviewer::new());
    let summary = doubles.run(&config(), &input(&repo, SCENARIO));
    assert_eq!(summary.exit_code(), exit_codes::OK);

    let total = repo
        .git(&["diff", "--name-only", &summary.baseline, "HEAD"])
        .expect("diff names");
    let mut total: Vec<&str> = total.lines().collect();
    total.sort_unstable();

    let mut union = Vec::new();
    for task in &summary.completed {
        let sha = task.checkpoint.as_deref().expect("checkpoint");
        let parent = format!("{sha}^");
        let names = repo
            .git(&["diff", "--name-only", &parent, sha])
            .expect("checkpoint names");
        for name in names.lines() {
            let whole = repo
                .git(&["diff", &summary.baseline, "HEAD", "--", name])
                .expect("file diff");
            let own = repo
                .git(&["diff", &parent, sha, "--", name])
                .expect("checkpoint diff");
            assert_eq!(whole, own, "diff of {name} differs from its checkpoint");
            union.push(name.to_string());
        }
    }
    union.sort_unstable();
    assert_eq!(union, total);
}

#[test]
fn fail_fast_cancels_siblings_without_new_checkpoints() {
    let repo = TestRepo::new().expect("repo");
    let start = repo.head().expect("head");
    let doc = "\
- [ ] Broken task <!-- category: independent, group: a, files: x.go -->
- [ ] Slow one <!-- category: independent, group: b, files: y.go -->
- [ ] Slow two <!-- category: independent, group: c, files: z.go -->
";
    let slow = Duration::from_secs(5);
    let backend = ScriptedBackend::new()
        .script("Broken task", vec![ScriptedStep::fail("compile error")])
        .script(
            "Slow one",
            vec![ScriptedStep::ok("done").write("y.go", "y\n").delay(slow)],
        )
        .script(
            "Slow two",
            vec![ScriptedStep::ok("done").write("z.go", "z\n").delay(slow)],
        );
    let doubles = Doubles::new(backend, ScriptedReviewer::new());
    let config = EngineConfig {
        max_parallel: 3,
        ..config()
    };

    let summary = doubles.run(&config, &input(&repo, doc));

    assert_eq!(summary.exit_code(), exit_codes::FAILED);
    match &summary.stopped {
        Some(StopReason::PhaseFailed(err)) => {
            assert_eq!(err.phase, Phase::Parallel);
            assert_eq!(err.task, "Broken task");
            assert_eq!(err.baseline, start);
        }
        other => panic!("unexpected stop: {other:?}"),
    }
    assert!(summary.completed.is_empty());
    let broken = summary
        .failed
        .iter()
        .find(|t| t.name == "Broken task")
        .expect("broken task reported");
    assert!(!broken.cancelled);
    assert!(summary.failed.iter().filter(|t| t.name != "Broken task").all(|t| t.cancelled));

    assert_eq!(repo.head().expect("head"), start);
    assert!(repo.subjects_since(&start).expect("log").is_empty());
    assert_eq!(repo.status().expect("status"), "");
    assert!(doubles.reviewer.calls().is_empty());
}

#[test]
fn continue_on_error_keeps_sibling_checkpoints() {
    let repo = TestRepo::new().expect("repo");
    let start = repo.head().expect("head");
    let doc = "\
- [ ] Broken task <!-- category: independent, group: a, files: x.go -->
- [ ] Good task <!-- category: independent, group: b, files: y.go -->
";
    let backend = ScriptedBackend::new()
        .script("Broken task", vec![ScriptedStep::fail("compile error").write("x.go", "bad\n")])
        .script("Good task", vec![ScriptedStep::ok("done").write("y.go", "y\n")]);
    let doubles = Doubles::new(backend, ScriptedReviewer::new());
    let config = EngineConfig {
        fail_fast: false,
        ..config()
    };

    let summary = doubles.run(&config, &input(&repo, doc));

    assert_eq!(summary.exit_code(), exit_codes::FAILED);
    assert_eq!(summary.stopped, None);
    assert_eq!(summary.completed.len(), 1);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(
        repo.subjects_since(&start).expect("log"),
        vec!["conductor: Good task"]
    );
    assert!(!repo.path("x.go").exists());
}

#[test]
fn self_correction_within_budget_completes() {
    let repo = TestRepo::new().expect("repo");
    let doc = "- [ ] Parser core <!-- category: fundamental, order: 1, files: a.go -->\n";
    let backend = ScriptedBackend::new().script(
        "Parser core",
        vec![
            ScriptedStep::fail("first failure"),
            ScriptedStep::fail("second failure"),
            ScriptedStep::ok("done").write("a.go", "package a\n"),
        ],
    );
    let doubles = Doubles::new(backend, ScriptedReviewer::new());
    let config = EngineConfig {
        max_self_corrections: 3,
        ..config()
    };

    let summary = doubles.run(&config, &input(&repo, doc));

    assert_eq!(summary.exit_code(), exit_codes::OK);
    assert_eq!(summary.completed.len(), 1);
    assert_eq!(summary.completed[0].attempts, 3);
}

#[test]
fn self_correction_over_budget_stops_phase_one() {
    let repo = TestRepo::new().expect("repo");
    let start = repo.head().expect("head");
    let backend = ScriptedBackend::new().script(
        "Parser core",
        vec![
            ScriptedStep::fail("first failure").write("a.go", "broken\n"),
            ScriptedStep::fail("second failure"),
            ScriptedStep::ok("done").write("a.go", "package a\n"),
        ],
    );
    let doubles = Doubles::new(backend, ScriptedReviewer::new());
    let config = EngineConfig {
        max_self_corrections: 1,
        ..config()
    };

    let summary = doubles.run(&config, &input(&repo, SCENARIO));

    assert_eq!(summary.exit_code(), exit_codes::FAILED);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].attempts, 2);
    assert_eq!(
        summary.failed[0].error.as_deref().map(|e| e.contains("second failure")),
        Some(true)
    );
    assert!(matches!(
        &summary.stopped,
        Some(StopReason::PhaseFailed(err)) if err.phase == Phase::Sequential && err.task == "Parser core"
    ));
    assert_eq!(summary.not_started, vec!["HTTP handler", "Handler tests"]);
    assert_eq!(repo.head().expect("head"), start);
    assert_eq!(repo.status().expect("status"), "");
}

#[test]
fn replan_without_planner_restores_baseline_exactly() {
    let repo = TestRepo::new().expect("repo");
    let start = repo.head().expect("head");
    let doc = "- [ ] Parser core <!-- category: fundamental, order: 1, files: a.go, README.md -->\n";
    let backend = ScriptedBackend::new().script(
        "Parser core",
        vec![
            ScriptedStep::ok("done")
                .write("a.go", "package a\n")
                .write("README.md", "rewritten\n"),
        ],
    );
    let reviewer = ScriptedReviewer::new().reply("layering is wrong\nStatus: NEEDS_REPLAN");
    let doubles = Doubles::new(backend, reviewer);

    let summary = doubles.run(&config(), &input(&repo, doc));

    assert_eq!(summary.exit_code(), exit_codes::REPLAN);
    assert_eq!(summary.stopped, Some(StopReason::ReplanRequired));
    assert!(summary.replan_triggered);
    assert_eq!(summary.final_verdict, Some(Verdict::NeedsReplan));
    assert!(summary.completed.is_empty());
    assert_eq!(summary.rolled_back.len(), 1);

    assert_eq!(repo.head().expect("head"), start);
    assert_eq!(repo.status().expect("status"), "");
    assert_eq!(repo.read("README.md").expect("read"), "hello\n");
    assert!(!repo.path("a.go").exists());
    assert!(
        doubles
            .sink
            .events()
            .contains(&Event::ReplanRequested { iteration: 1 })
    );
}

#[test]
fn replan_with_planner_reenters_phase_one() {
    let repo = TestRepo::new().expect("repo");
    let start = repo.head().expect("head");
    let doc = "- [ ] Parser core <!-- category: fundamental, order: 1, files: a.go -->\n";
    let revised = "- [ ] Parser v2 <!-- category: fundamental, order: 1, files: a2.go -->\n";
    let backend = ScriptedBackend::new()
        .script(
            "Parser core",
            vec![ScriptedStep::ok("done").write("a.go", "package a\n")],
        )
        .script("must change", vec![ScriptedStep::ok(revised)])
        .script(
            "Parser v2",
            vec![ScriptedStep::ok("done").write("a2.go", "package a\n")],
        );
    let reviewer = ScriptedReviewer::new().reply("Status: NEEDS_REPLAN");
    let doubles = Doubles::new(backend, reviewer);
    let planner = BackendPlanner::new(
        &doubles.backend,
        repo.root(),
        Duration::from_secs(10),
        10_000,
        RetryPolicy::disabled(),
    );
    let collab = Collaborators {
        planner: Some(&planner),
        ..doubles.collab()
    };

    let summary = run_workflow(&config(), &collab, &input(&repo, doc)).expect("workflow");

    assert_eq!(summary.exit_code(), exit_codes::OK);
    assert!(summary.replan_triggered);
    assert_eq!(summary.replans, 1);
    assert_eq!(summary.final_verdict, Some(Verdict::Pass));
    let names: Vec<&str> = summary.completed.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["Parser v2"]);
    assert!(!repo.path("a.go").exists());
    assert_eq!(repo.read("a2.go").expect("read"), "package a\n");
    assert_eq!(
        repo.subjects_since(&start).expect("log"),
        vec!["conductor: Parser v2"]
    );
    let kept = repo
        .root()
        .join(".conductor/runs/t-1")
        .join(&summary.run_id)
        .join("tasks-1.md");
    assert!(kept.exists());
}

#[test]
fn replan_limit_stops_the_run() {
    let repo = TestRepo::new().expect("repo");
    let doc = "- [ ] Parser core <!-- category: fundamental, order: 1, files: a.go -->\n";
    let backend = ScriptedBackend::new().script(
        "Parser core",
        vec![ScriptedStep::ok("done").write("a.go", "package a\n")],
    );
    let reviewer = ScriptedReviewer::new().reply("Status: NEEDS_REPLAN");
    let doubles = Doubles::new(backend, reviewer);
    let planner = BackendPlanner::new(
        &doubles.backend,
        repo.root(),
        Duration::from_secs(10),
        10_000,
        RetryPolicy::disabled(),
    );
    let collab = Collaborators {
        planner: Some(&planner),
        ..doubles.collab()
    };
    let config = EngineConfig {
        max_replans: 0,
        ..config()
    };

    let summary = run_workflow(&config, &collab, &input(&repo, doc)).expect("workflow");

    assert_eq!(summary.stopped, Some(StopReason::ReplanLimit { replans: 0 }));
    assert_eq!(summary.exit_code(), exit_codes::REPLAN);
}

#[test]
fn autofix_round_commits_its_own_checkpoint() {
    let repo = TestRepo::new().expect("repo");
    let start = repo.head().expect("head");
    let doc = "- [ ] Parser core <!-- category: fundamental, order: 1, files: a.go -->\n";
    let backend = ScriptedBackend::new()
        .script(
            "Parser core",
            vec![ScriptedStep::ok("done").write("a.go", "package a\n")],
        )
        .script(
            "phase 1 (sequential) (autofix round 1)",
            vec![ScriptedStep::ok("fixed").write("a.go", "package a\n\n// Parse reads input.\n")],
        );
    let reviewer = ScriptedReviewer::new()
        .reply("a.go: exported function lacks a comment\nStatus: NEEDS_ATTENTION")
        .reply("Status: PASS");
    let doubles = Doubles::new(backend, reviewer);

    let summary = doubles.run(&config(), &input(&repo, doc));

    assert_eq!(summary.exit_code(), exit_codes::OK);
    assert_eq!(summary.final_verdict, Some(Verdict::Pass));
    assert_eq!(
        repo.subjects_since(&start).expect("log"),
        vec![
            "conductor: Parser core",
            "conductor: autofix phase 1 (sequential) (round 1)"
        ]
    );
    let autofix_prompt = &doubles
        .backend
        .prompts_for("phase 1 (sequential) (autofix round 1)")[0];
    assert!(autofix_prompt.contains("exported function lacks a comment"));
    assert_eq!(doubles.reviewer.calls().len(), 2);
}

#[test]
fn persisting_attention_stops_on_explicit_decision() {
    let repo = TestRepo::new().expect("repo");
    let backend = scenario_backend();
    let reviewer = ScriptedReviewer::new()
        .reply("Status: NEEDS_ATTENTION")
        .reply("Status: NEEDS_ATTENTION");
    let doubles = Doubles::new(backend, reviewer);

    let summary = doubles.run(&config(), &input(&repo, SCENARIO));

    assert_eq!(summary.exit_code(), exit_codes::ATTENTION);
    assert_eq!(
        summary.stopped,
        Some(StopReason::Attention {
            label: "phase 1 (sequential)".to_string()
        })
    );
    assert_eq!(summary.not_started, vec!["HTTP handler", "Handler tests"]);
}

#[test]
fn continuing_past_attention_requires_decider_consent() {
    let repo = TestRepo::new().expect("repo");
    let doc = "- [ ] Parser core <!-- category: fundamental, order: 1, files: a.go -->\n";
    let backend = ScriptedBackend::new().script(
        "Parser core",
        vec![ScriptedStep::ok("done").write("a.go", "package a\n")],
    );
    let reviewer = ScriptedReviewer::new()
        .reply("Status: NEEDS_ATTENTION")
        .reply("Status: NEEDS_ATTENTION");
    let mut doubles = Doubles::new(backend, reviewer);
    doubles.decider = FixedDecider(AttentionDecision::Continue);

    let summary = doubles.run(&config(), &input(&repo, doc));

    assert_eq!(summary.exit_code(), exit_codes::OK);
    assert_eq!(summary.final_verdict, Some(Verdict::NeedsAttention));
}

#[test]
fn crashed_review_is_advisory() {
    let repo = TestRepo::new().expect("repo");
    let doc = "- [ ] Parser core <!-- category: fundamental, order: 1, files: a.go -->\n";
    let backend = ScriptedBackend::new().script(
        "Parser core",
        vec![ScriptedStep::ok("done").write("a.go", "package a\n")],
    );
    let reviewer = ScriptedReviewer::new().crash("reviewer process died");
    let doubles = Doubles::new(backend, reviewer);

    let summary = doubles.run(&config(), &input(&repo, doc));

    assert_eq!(summary.exit_code(), exit_codes::OK);
    assert_eq!(summary.completed.len(), 1);
    assert_eq!(doubles.reviewer.calls().len(), 2);
    assert_eq!(summary.final_verdict, Some(Verdict::Pass));
}

#[test]
fn crashed_re_review_keeps_attention_verdict_for_decider() {
    let repo = TestRepo::new().expect("repo");
    let doc = "- [ ] Parser core <!-- category: fundamental, order: 1, files: a.go -->\n";
    let backend = ScriptedBackend::new().script(
        "Parser core",
        vec![ScriptedStep::ok("done").write("a.go", "package a\n")],
    );
    let reviewer = ScriptedReviewer::new()
        .reply("a.go: parse errors are swallowed\nStatus: NEEDS_ATTENTION")
        .crash("reviewer process died")
        .crash("reviewer process died");
    let doubles = Doubles::new(backend, reviewer);

    let summary = doubles.run(&config(), &input(&repo, doc));

    assert_eq!(summary.exit_code(), exit_codes::ATTENTION);
    assert_eq!(summary.final_verdict, Some(Verdict::NeedsAttention));
    assert_eq!(
        summary.stopped,
        Some(StopReason::Attention {
            label: "phase 1 (sequential)".to_string()
        })
    );
    assert_eq!(doubles.reviewer.calls().len(), 2);
}

#[test]
fn failed_autofix_attempt_still_gets_re_reviewed() {
    let repo = TestRepo::new().expect("repo");
    let start = repo.head().expect("head");
    let doc = "- [ ] Parser core <!-- category: fundamental, order: 1, files: a.go -->\n";
    let backend = ScriptedBackend::new()
        .script(
            "Parser core",
            vec![ScriptedStep::ok("done").write("a.go", "package a\n")],
        )
        .script(
            "phase 1 (sequential) (autofix round 1)",
            vec![ScriptedStep::fail("backend crashed")],
        );
    let reviewer = ScriptedReviewer::new()
        .reply("Status: NEEDS_ATTENTION")
        .reply("Status: PASS");
    let doubles = Doubles::new(backend, reviewer);

    let summary = doubles.run(&config(), &input(&repo, doc));

    assert_eq!(summary.exit_code(), exit_codes::OK);
    assert_eq!(summary.final_verdict, Some(Verdict::Pass));
    assert_eq!(
        repo.subjects_since(&start).expect("log"),
        vec!["conductor: Parser core"]
    );
    assert_eq!(doubles.reviewer.calls().len(), 2);
    assert!(doubles.sink.events().iter().any(|e| matches!(
        e,
        Event::TaskFailed { task, .. } if task.starts_with("autofix")
    )));
}

#[test]
fn memory_stays_out_of_parallel_prompts() {
    let repo = TestRepo::new().expect("repo");
    let doc = "\
- [ ] Parser core <!-- category: fundamental, order: 1, files: a.go -->
- [ ] Parser errors <!-- category: fundamental, order: 2, files: c.go -->
- [ ] Parser handler <!-- category: independent, group: impl, files: b.go -->
";
    let backend = ScriptedBackend::new()
        .script(
            "Parser core",
            vec![
                ScriptedStep::ok("PATTERN: parser errors carry the byte offset")
                    .write("a.go", "package a\n"),
            ],
        )
        .script(
            "Parser errors",
            vec![ScriptedStep::ok("done").write("c.go", "package a\n")],
        )
        .script(
            "Parser handler",
            vec![ScriptedStep::ok("done").write("b.go", "package b\n")],
        );
    let doubles = Doubles::new(backend, ScriptedReviewer::new());

    let summary = doubles.run(&config(), &input(&repo, doc));

    assert_eq!(summary.exit_code(), exit_codes::OK);
    let sequential = doubles.backend.prompts_for("Parser errors");
    assert!(sequential[0].contains("parser errors carry the byte offset"));
    let parallel = doubles.backend.prompts_for("Parser handler");
    assert_eq!(parallel.len(), 1);
    assert!(!parallel[0].contains("byte offset"));
}

#[test]
fn failed_checkpoint_names_phase_and_baseline_and_cleans_up() {
    let repo = TestRepo::new().expect("repo");
    let start = repo.head().expect("head");
    repo.git(&["config", "user.name", ""]).expect("config");
    let doc = "- [ ] Parser core <!-- category: fundamental, order: 1, files: a.go -->\n";
    let doubles = Doubles::new(scenario_backend(), ScriptedReviewer::new());

    let err = run_workflow(&config(), &doubles.collab(), &input(&repo, doc))
        .expect_err("commit fails");

    let failed = err.downcast_ref::<PhaseFailedError>().expect("typed error");
    assert_eq!(failed.phase, Phase::Sequential);
    assert_eq!(failed.task, "Parser core");
    assert_eq!(failed.baseline, start);
    assert!(format!("{err:#}").contains(&start));
    assert_eq!(repo.status().expect("status"), "");
    assert_eq!(repo.head().expect("head"), start);
}

#[test]
fn failed_checkpoint_in_batch_names_the_task() {
    let repo = TestRepo::new().expect("repo");
    let start = repo.head().expect("head");
    repo.git(&["config", "user.name", ""]).expect("config");
    let doc = "- [ ] HTTP handler <!-- category: independent, group: impl, files: b.go -->\n";
    let doubles = Doubles::new(scenario_backend(), ScriptedReviewer::new());

    let err = run_workflow(&config(), &doubles.collab(), &input(&repo, doc))
        .expect_err("commit fails");

    let failed = err.downcast_ref::<PhaseFailedError>().expect("typed error");
    assert_eq!(failed.phase, Phase::Parallel);
    assert_eq!(failed.task, "HTTP handler");
    assert_eq!(failed.baseline, start);
    assert_eq!(repo.status().expect("status"), "");
}

#[test]
fn disabled_review_never_calls_reviewer() {
    let repo = TestRepo::new().expect("repo");
    let doubles = Doubles::new(scenario_backend(), ScriptedReviewer::new());
    let config = EngineConfig {
        review_enabled: false,
        ..config()
    };

    let summary = doubles.run(&config, &input(&repo, SCENARIO));

    assert_eq!(summary.exit_code(), exit_codes::OK);
    assert_eq!(summary.final_verdict, None);
    assert!(doubles.reviewer.calls().is_empty());
}

#[test]
fn checked_tasks_are_skipped() {
    let repo = TestRepo::new().expect("repo");
    let doc = "\
- [x] Parser core <!-- category: fundamental, order: 1, files: a.go -->
- [ ] HTTP handler <!-- category: independent, group: impl, files: b.go -->
";
    let doubles = Doubles::new(scenario_backend(), ScriptedReviewer::new());

    let summary = doubles.run(&config(), &input(&repo, doc));

    assert_eq!(summary.skipped, vec!["Parser core"]);
    assert_eq!(summary.completed.len(), 1);
    assert!(doubles.backend.prompts_for("Parser core").is_empty());
}

#[test]
fn overlapping_batch_is_rejected_before_execution() {
    let repo = TestRepo::new().expect("repo");
    let start = repo.head().expect("head");
    let doc = "\
- [ ] Handler <!-- category: independent, group: impl, files: pkg/handler.go -->
- [ ] Package docs <!-- category: independent, group: docs, files: pkg -->
";
    let doubles = Doubles::new(ScriptedBackend::new(), ScriptedReviewer::new());

    let err = run_workflow(&config(), &doubles.collab(), &input(&repo, doc)).expect_err("overlap");

    assert!(err.downcast_ref::<OverlappingScopesError>().is_some());
    assert!(doubles.backend.calls().is_empty());
    assert_eq!(repo.head().expect("head"), start);
}

#[test]
fn dirty_tree_fails_fast_by_default() {
    let repo = TestRepo::new().expect("repo");
    repo.write("notes.txt", "wip\n").expect("write");
    let doubles = Doubles::new(scenario_backend(), ScriptedReviewer::new());

    let err = run_workflow(&config(), &doubles.collab(), &input(&repo, SCENARIO))
        .expect_err("dirty tree");

    let dirty = err.downcast_ref::<DirtyTreeError>().expect("typed error");
    assert_eq!(dirty.paths, vec!["notes.txt"]);
    assert!(doubles.backend.calls().is_empty());
}
