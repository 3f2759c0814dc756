//! Resource pairing, naming order, shutdown bounds, link rejection and
//! teardown on error.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;

use mediarig::clock::{ClockTime, ManualClock};
use mediarig::config::RecorderConfig;
use mediarig::element::PadRef;
use mediarig::engine::sim::{Op, SimConfig, SimEngine};
use mediarig::engine::{Engine, FragmentContext};
use mediarig::pipeline::{
    Controller, ControllerConfig, EosInjection, NodeSpec, Outcome, PipelineSpec, RunReport,
    RunState,
};
use mediarig::recipes::Recipe;
use mediarig::segment::{NamingConfig, SegmentNamingPolicy};
use mediarig::Error;

fn run_recipe(recipe: Recipe, sim: &Arc<SimEngine>, stop_after_ms: u64) -> RunReport {
    let mut config = RecorderConfig::default();
    config.recipe = recipe;
    config.run.stop_after_ms = Some(stop_after_ms);
    let spec = recipe.spec(&config).unwrap();
    Controller::assemble(sim.clone(), &spec, config.controller_config())
        .unwrap()
        .run()
}

/// Every requested pad is released exactly once, before its node is destroyed.
fn assert_pads_paired(sim: &SimEngine) {
    let journal = sim.journal();
    let mut released_at: HashMap<PadRef, Vec<usize>> = HashMap::new();
    let mut destroyed_at: HashMap<String, usize> = HashMap::new();
    for (i, op) in journal.iter().enumerate() {
        match op {
            Op::PadReleased { pad } => released_at.entry(pad.clone()).or_default().push(i),
            Op::NodeDestroyed { node, .. } => {
                destroyed_at.insert(node.clone(), i);
            }
            _ => {}
        }
    }

    let requested = sim.requested_pads();
    assert!(!requested.is_empty());
    for pad in &requested {
        let releases = released_at.get(pad).cloned().unwrap_or_default();
        assert_eq!(releases.len(), 1, "{} released {} times", pad, releases.len());
        let destroyed = destroyed_at[&pad.node];
        assert!(releases[0] < destroyed, "{} released after its node", pad);
    }
    assert_eq!(released_at.len(), requested.len());
    assert!(sim.destroyed_nodes().iter().all(|(_, outstanding)| *outstanding == 0));
}

#[test]
fn test_request_pads_released_once_on_success() {
    let sim = SimEngine::new(Arc::new(ManualClock::new(0)));
    let report = run_recipe(Recipe::DoubleteeS3, &sim, 20_000);

    assert!(report.is_success(), "{:?}", report.outcome);
    assert!(report.teardown_errors.is_empty());
    assert_eq!(sim.requested_pads().len(), 8);
    assert_pads_paired(&sim);
    assert_eq!(sim.live_nodes(), 0);
    assert_eq!(sim.open_buses(), 0);
}

proptest! {
    #[test]
    fn test_segment_starts_strictly_increase(
        base in 0u64..2_000_000_000_000,
        duration_ms in 1u64..120_000,
        extra in prop::collection::vec(0u64..60_000, 1..20),
    ) {
        let clock = Arc::new(ManualClock::new(base));
        let sim = SimEngine::new(clock.clone());
        let engine: Arc<dyn Engine> = sim.clone();
        let nested = engine.create_node("awss3sink", "gcs_sink").unwrap();
        let naming = NamingConfig { duration_ms, ..NamingConfig::default() };
        let policy = SegmentNamingPolicy::new(&engine, nested, "key", naming.clone());

        let mut previous: Option<u64> = None;
        for (id, gap) in extra.iter().enumerate() {
            let context = FragmentContext {
                node: "split_mux_sink".into(),
                fragment_id: id as u32,
                running_time: ClockTime::ZERO,
            };
            let location = policy.on_format_location(&context);
            let (start, end) = naming.parse(&location).unwrap();
            prop_assert_eq!(end - start, duration_ms);
            if let Some(previous) = previous {
                prop_assert!(start > previous);
            }
            previous = Some(start);
            clock.advance(ClockTime::from_millis(duration_ms + gap));
        }
    }
}

#[test]
fn test_stalled_drain_is_forced_after_grace_period() {
    let clock = Arc::new(ManualClock::new(0));
    let sim = SimEngine::with_config(
        clock.clone(),
        SimConfig {
            drain_latency: None,
            ..SimConfig::default()
        },
    );
    let spec = PipelineSpec::new("stalled")
        .with_node(NodeSpec::new("audiotestsrc", "src"))
        .with_node(NodeSpec::new("fakesink", "sink"))
        .link_many(&["src", "sink"]);
    let config = ControllerConfig {
        grace_period: ClockTime::from_secs(60),
        ..ControllerConfig::default()
    };
    let controller = Controller::assemble(sim.clone(), &spec, config).unwrap();
    let interrupt = controller.interrupt();
    sim.schedule_action(ClockTime::from_millis(5_000), move || interrupt.raise());
    let report = controller.run();

    assert_eq!(report.eos_injected_at, Some(ClockTime::from_millis(5_000)));
    assert_eq!(report.terminated_at, ClockTime::from_millis(65_000));
    assert!(matches!(&report.outcome, Outcome::Error(m) if m.contains("timed out")));

    // Never terminated before EOS was injected.
    let stopping = report
        .transitions
        .iter()
        .position(|s| *s == RunState::Stopping)
        .unwrap();
    let terminated = report
        .transitions
        .iter()
        .position(|s| matches!(s, RunState::Terminated(_)))
        .unwrap();
    assert!(stopping < terminated);
    assert_eq!(sim.live_nodes(), 0);
}

#[test]
fn test_mismatched_rate_filter_leaves_no_link() {
    let sim = SimEngine::new(Arc::new(ManualClock::new(0)));
    let spec = PipelineSpec::new("mismatch")
        .with_node(NodeSpec::new("audiotestsrc", "audio_source"))
        .with_node(NodeSpec::new("audioresample", "audio_resample"))
        .with_node(NodeSpec::new("fdkaacenc", "avenc_aac"))
        .with_node(NodeSpec::new("fakesink", "fake_sink"))
        .link_many(&["audio_source", "audio_resample"])
        .link_filtered(
            "audio_resample",
            "avenc_aac",
            mediarig::format::Caps::audio_raw(17_000, 1),
        )
        .link_many(&["avenc_aac", "fake_sink"]);

    let err = Controller::assemble(sim.clone(), &spec, ControllerConfig::default()).unwrap_err();
    assert!(matches!(err, Error::Link { .. }));
    assert_eq!(err.exit_code(), mediarig::error::EXIT_CONSTRUCTION);

    let resample_links = sim
        .journal()
        .iter()
        .filter(|op| matches!(op, Op::Linked { src, .. } if src.node == "audio_resample"))
        .count();
    assert_eq!(resample_links, 0);
    assert_eq!(sim.live_nodes(), 0);
}

#[test]
fn test_runtime_error_tears_down_like_success() {
    let ok = SimEngine::new(Arc::new(ManualClock::new(0)));
    let success = run_recipe(Recipe::DoubleteeS3, &ok, 20_000);
    assert!(success.is_success());

    let failing = SimEngine::new(Arc::new(ManualClock::new(0)));
    failing.schedule_error(ClockTime::from_millis(7_000), "gcs_sink", "upload failed");
    let failure = run_recipe(Recipe::DoubleteeS3, &failing, 20_000);

    assert!(matches!(&failure.outcome, Outcome::Error(m) if m.contains("upload failed")));
    assert_eq!(failure.exit_code(), 1);
    assert_eq!(failure.eos_injected_at, None);
    assert_eq!(failure.terminated_at, ClockTime::from_millis(7_000));

    assert_pads_paired(&failing);
    assert_eq!(failing.released_pads(), ok.released_pads());
    assert_eq!(failing.destroyed_nodes(), ok.destroyed_nodes());
    assert_eq!(failing.live_nodes(), 0);
    assert_eq!(failing.open_buses(), 0);
}

#[test]
fn test_rejected_start_still_tears_down() {
    let sim = SimEngine::with_config(
        Arc::new(ManualClock::new(0)),
        SimConfig {
            reject_state: Some(mediarig::engine::EngineState::Playing),
            ..SimConfig::default()
        },
    );
    let mut config = RecorderConfig::default();
    config.recipe = Recipe::SplitmuxS3;
    let spec = config.recipe.spec(&config).unwrap();
    let controller = Controller::assemble(sim.clone(), &spec, ControllerConfig {
        eos_target: EosInjection::Node("split_mux_sink".into()),
        ..ControllerConfig::default()
    })
    .unwrap();
    let report = controller.run();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.started_at, None);
    assert_pads_paired(&sim);
    assert_eq!(sim.live_nodes(), 0);
}
