//! End-to-end recording runs on the simulated engine.

use std::sync::Arc;

use mediarig::clock::{Clock, ClockTime, ManualClock};
use mediarig::element::PropertyValue;
use mediarig::engine::sim::SimEngine;
use mediarig::engine::Engine;
use mediarig::pipeline::{
    Controller, ControllerConfig, EosInjection, NodeSpec, Outcome, PadEndpoint, PipelineSpec,
    RunState, SegmentSpec,
};
use mediarig::segment::NamingConfig;

/// videotestsrc -> queue -> x264enc -> splitmuxsink (uploading through gcs_sink).
fn segmented_video(duration_ms: u64) -> PipelineSpec {
    PipelineSpec::new("segmented")
        .with_node(NodeSpec::new("videotestsrc", "video_source"))
        .with_node(NodeSpec::new("queue", "video_queue"))
        .with_node(NodeSpec::new("x264enc", "x264_enc").option("bitrate", 128u32))
        .with_node(NodeSpec::new("splitmuxsink", "split_mux_sink").option("sink", "gcs_sink"))
        .with_node(NodeSpec::new("awss3sink", "gcs_sink").option("bucket", "recordings"))
        .link_many(&["video_source", "video_queue", "x264_enc"])
        .request_link(
            PadEndpoint::fixed("x264_enc", "src"),
            PadEndpoint::request("split_mux_sink", "video"),
        )
        .with_segment(SegmentSpec {
            sink_node: "split_mux_sink".into(),
            nested_sink: Some("gcs_sink".into()),
            key_property: Some("key".into()),
            naming: NamingConfig {
                duration_ms,
                ..NamingConfig::default()
            },
        })
}

fn keys(sim: &SimEngine) -> Vec<String> {
    sim.property_writes("gcs_sink", "key")
        .iter()
        .map(PropertyValue::as_string)
        .collect()
}

#[test]
fn test_forty_second_run_names_three_segments() {
    let clock = Arc::new(ManualClock::new(0));
    let sim = SimEngine::new(clock.clone());
    let config = ControllerConfig {
        stop_after: Some(ClockTime::from_millis(40_000)),
        eos_target: EosInjection::Node("split_mux_sink".into()),
        ..ControllerConfig::default()
    };

    let report = Controller::assemble(sim.clone(), &segmented_video(15_000), config)
        .unwrap()
        .run();

    assert!(report.is_success(), "{:?}", report.outcome);
    assert_eq!(
        keys(&sim),
        vec!["vm/0_15000.mp4", "vm/15000_30000.mp4", "vm/30000_45000.mp4"]
    );
    assert_eq!(report.segments, keys(&sim));

    let starts: Vec<ClockTime> = sim.fragments().into_iter().map(|(_, at)| at).collect();
    assert_eq!(
        starts,
        vec![
            ClockTime::ZERO,
            ClockTime::from_millis(15_000),
            ClockTime::from_millis(30_000)
        ]
    );

    // The segment duration reached the sink in nanoseconds.
    assert_eq!(
        sim.property_writes("split_mux_sink", "max-size-time"),
        vec![PropertyValue::from(15_000_000_000u64)]
    );
    assert_eq!(report.eos_injected_at, Some(ClockTime::from_millis(40_000)));
    assert_eq!(report.terminated_at, ClockTime::from_millis(40_500));
    assert_eq!(clock.now(), ClockTime::from_millis(40_500));
}

#[test]
fn test_audio_request_pads_are_distinct_and_independent() {
    let sim = SimEngine::new(Arc::new(ManualClock::new(0)));
    let mux = sim.create_node("mp4mux", "mp4_mux").unwrap();

    let first = sim.request_pad(mux, "audio_%u").unwrap();
    let second = sim.request_pad(mux, "audio_%u").unwrap();
    assert_ne!(first, second);
    assert_eq!((first.name.as_str(), second.name.as_str()), ("audio_0", "audio_1"));

    sim.release_pad(&second).unwrap();
    sim.release_pad(&first).unwrap();
    let released: Vec<String> = sim.released_pads().into_iter().map(|p| p.pad).collect();
    assert_eq!(released, vec!["audio_1", "audio_0"]);

    sim.destroy_node(mux).unwrap();
    assert_eq!(sim.destroyed_nodes(), vec![("mp4_mux".to_string(), 0)]);
}

#[test]
fn test_interrupt_stops_gracefully() {
    let clock = Arc::new(ManualClock::new(0));
    let sim = SimEngine::new(clock.clone());
    let config = ControllerConfig {
        grace_period: ClockTime::from_secs(60),
        eos_target: EosInjection::Node("split_mux_sink".into()),
        ..ControllerConfig::default()
    };
    let controller = Controller::assemble(sim.clone(), &segmented_video(15_000), config).unwrap();

    let interrupt = controller.interrupt();
    sim.schedule_action(ClockTime::from_millis(5_000), move || interrupt.raise());
    let report = controller.run();

    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(report.eos_injected_at, Some(ClockTime::from_millis(5_000)));
    assert!(report.terminated_at <= ClockTime::from_millis(65_000));
    assert_eq!(report.terminated_at, ClockTime::from_millis(5_500));
    assert_eq!(
        report.transitions,
        vec![
            RunState::Constructed,
            RunState::Playing,
            RunState::Stopping,
            RunState::Terminated(Outcome::Success),
        ]
    );
    assert_eq!(sim.eos_injections(), 1);
    assert_eq!(keys(&sim), vec!["vm/0_15000.mp4"]);
}

#[test]
fn test_wall_clock_base_appears_in_identifiers() {
    let sim = SimEngine::new(Arc::new(ManualClock::new(1_700_000_000_000)));
    let config = ControllerConfig {
        stop_after: Some(ClockTime::from_millis(12_000)),
        eos_target: EosInjection::Node("split_mux_sink".into()),
        ..ControllerConfig::default()
    };
    let report = Controller::assemble(sim.clone(), &segmented_video(10_000), config)
        .unwrap()
        .run();

    assert!(report.is_success());
    assert_eq!(
        report.segments,
        vec![
            "vm/1700000000000_1700000010000.mp4",
            "vm/1700000010000_1700000020000.mp4"
        ]
    );
}
