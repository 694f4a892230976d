use pipewright_core::{
    GroupKind, PipelineDefinition, PipelineKind, Record, RunState, Step, StepGroup,
};
use pipewright_engine::{
    ChannelShape, Component, ComponentRegistry, EngineConfig, EngineError, LaunchMode,
    PipelineRunner, Result, RunHandle, StepChannels, StepContext,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

type Collected = Arc<Mutex<Vec<Record>>>;

/// Stores every record it reads and passes it on
struct Collect {
    input: String,
    records: Collected,
}

impl Component for Collect {
    fn upstream_steps(&self) -> Vec<String> {
        vec![self.input.clone()]
    }

    fn start(self: Box<Self>, ctx: StepContext) -> Result<StepChannels> {
        let input = ctx.input(0)?;
        let (tx, output) = ctx.record_channel();
        let records = self.records;
        ctx.spawn(async move {
            while let Some(record) = input.recv().await {
                records.lock().unwrap().push(record.clone());
                if tx.send(record).await.is_err() {
                    break;
                }
            }
            Ok(())
        });
        Ok(StepChannels::Output(output))
    }
}

/// Remembers the `value` parameter it was started with
struct Capture {
    value: String,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Component for Capture {
    fn start(self: Box<Self>, ctx: StepContext) -> Result<StepChannels> {
        self.seen.lock().unwrap().push(self.value);
        let (tx, output) = ctx.record_channel();
        ctx.spawn(async move {
            drop(tx);
            Ok(())
        });
        Ok(StepChannels::Output(output))
    }
}

/// Remembers how many records `Collect` steps had stored when it started
struct Tally {
    records: Collected,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Component for Tally {
    fn start(self: Box<Self>, ctx: StepContext) -> Result<StepChannels> {
        let stored = self.records.lock().unwrap().len();
        self.seen.lock().unwrap().push(stored.to_string());
        let (tx, output) = ctx.record_channel();
        ctx.spawn(async move {
            drop(tx);
            Ok(())
        });
        Ok(StepChannels::Output(output))
    }
}

/// Notes the moment each instance starts
struct Clock {
    starts: Arc<Mutex<Vec<Instant>>>,
}

impl Component for Clock {
    fn start(self: Box<Self>, ctx: StepContext) -> Result<StepChannels> {
        self.starts.lock().unwrap().push(Instant::now());
        let (tx, output) = ctx.record_channel();
        ctx.spawn(async move {
            drop(tx);
            Ok(())
        });
        Ok(StepChannels::Output(output))
    }
}

/// Fails or panics as soon as it runs
struct Broken {
    panics: bool,
}

impl Component for Broken {
    fn start(self: Box<Self>, ctx: StepContext) -> Result<StepChannels> {
        let (tx, output) = ctx.record_channel();
        let panics = self.panics;
        ctx.spawn(async move {
            let _tx = tx;
            if panics {
                panic!("worker exploded");
            }
            let failure: anyhow::Result<()> = Err(anyhow::anyhow!("source table vanished"));
            failure
        });
        Ok(StepChannels::Output(output))
    }
}

struct Harness {
    runner: PipelineRunner,
    collected: Collected,
    captured: Arc<Mutex<Vec<String>>>,
    starts: Arc<Mutex<Vec<Instant>>>,
}

fn harness() -> Harness {
    let collected: Collected = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::new(Mutex::new(Vec::new()));
    let starts = Arc::new(Mutex::new(Vec::new()));

    let mut registry = ComponentRegistry::with_builtins();
    let records = collected.clone();
    registry.register("Collect", ChannelShape::Output, move |params| {
        Ok(Box::new(Collect {
            input: params.required("inputStepName")?.to_string(),
            records: records.clone(),
        }))
    });
    let seen = captured.clone();
    registry.register("Capture", ChannelShape::Output, move |params| {
        Ok(Box::new(Capture {
            value: params.required("value")?.to_string(),
            seen: seen.clone(),
        }))
    });
    let (records, seen) = (collected.clone(), captured.clone());
    registry.register("Tally", ChannelShape::Output, move |_| {
        Ok(Box::new(Tally {
            records: records.clone(),
            seen: seen.clone(),
        }))
    });
    let clock = starts.clone();
    registry.register("Clock", ChannelShape::Output, move |_| {
        Ok(Box::new(Clock {
            starts: clock.clone(),
        }))
    });
    registry.register("Broken", ChannelShape::Output, |params| {
        Ok(Box::new(Broken {
            panics: params.optional("panic").is_some(),
        }))
    });

    Harness {
        runner: PipelineRunner::new(registry, EngineConfig::headless()),
        collected,
        captured,
        starts,
    }
}

fn generator(rows: u64) -> Step {
    Step::new("RowGenerator").with_data("numRows", rows.to_string())
}

fn collect(input: &str) -> Step {
    Step::new("Collect").with_data("inputStepName", input)
}

fn states(handle: &RunHandle) -> Vec<RunState> {
    handle.history().into_iter().map(|s| s.status).collect()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_for_terminal(handle: &RunHandle) {
    wait_until(|| {
        handle
            .status()
            .map(|s| s.status.is_terminal())
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_once_pipeline_completes() {
    let h = harness();
    let definition = PipelineDefinition::new(PipelineKind::Once).with_group(
        "load",
        StepGroup::new(GroupKind::Sequential)
            .with_step("gen", generator(25))
            .with_step(
                "map",
                Step::new("FieldMapper")
                    .with_data("inputStepName", "gen")
                    .with_sub_step(
                        Step::new("RenameField")
                            .with_data("fromField", "rowNumber")
                            .with_data("toField", "id"),
                    ),
            )
            .with_step("log", Step::new("StdOutLogger").with_data("inputStepName", "map"))
            .with_step("sink", collect("log")),
    );

    let handle = h.runner.launch(definition, LaunchMode::Blocking).await.unwrap();
    assert_eq!(
        states(&handle),
        vec![RunState::Starting, RunState::Running, RunState::Complete]
    );

    let records = h.collected.lock().unwrap();
    assert_eq!(records.len(), 25);
    assert!(records.iter().all(|r| r.contains("id") && !r.contains("rowNumber")));
}

#[tokio::test]
async fn test_invalid_definition_is_rejected_before_start() {
    let h = harness();
    let definition = PipelineDefinition::new(PipelineKind::Once).with_group(
        "load",
        StepGroup::new(GroupKind::Sequential).with_step("x", Step::new("Teleporter")),
    );

    let err = h.runner.launch(definition, LaunchMode::Blocking).await.err().unwrap();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(err.is_configuration_error());
    assert!(h.runner.runs().list().is_empty());
}

#[tokio::test]
async fn test_shutdown_request_stops_run() {
    let h = harness();
    let definition = PipelineDefinition::new(PipelineKind::Once).with_group(
        "load",
        StepGroup::new(GroupKind::Sequential).with_step("gen", generator(u64::from(u32::MAX))),
    );

    let handle = h.runner.launch(definition, LaunchMode::Background).await.unwrap();
    wait_until(|| handle.status().map(|s| s.status) == Some(RunState::Running)).await;
    assert!(handle.request_shutdown());

    let status = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(status.status, RunState::Shutdown);
    assert!(status.end_time.is_some());
}

#[tokio::test]
async fn test_step_failure_reported_once() {
    let h = harness();
    let definition = PipelineDefinition::new(PipelineKind::Once).with_group(
        "load",
        StepGroup::new(GroupKind::Sequential)
            .with_step("gen", generator(u64::from(u32::MAX)))
            .with_step("bad", Step::new("Broken"))
            .with_step("worse", Step::new("Broken")),
    );

    let handle = h.runner.launch(definition, LaunchMode::Background).await.unwrap();
    wait_for_terminal(&handle).await;
    let history = handle.history();
    let status = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

    let failures: Vec<_> = history
        .iter()
        .filter(|s| s.status == RunState::CompleteWithError)
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.as_deref().unwrap().contains("source table vanished"));
    assert_eq!(status.status, RunState::CompleteWithError);
}

#[tokio::test]
async fn test_panicking_step_fails_run() {
    let h = harness();
    let definition = PipelineDefinition::new(PipelineKind::Once).with_group(
        "load",
        StepGroup::new(GroupKind::Sequential)
            .with_step("bad", Step::new("Broken").with_data("panic", "yes")),
    );

    let handle = h.runner.launch(definition, LaunchMode::Background).await.unwrap();
    let status = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(status.status, RunState::CompleteWithError);
    assert!(status.error.unwrap().contains("worker exploded"));
}

#[tokio::test]
async fn test_background_combiner_waits_for_late_inputs() {
    let h = harness();
    let definition = PipelineDefinition::new(PipelineKind::Once)
        .with_group(
            "bridge",
            StepGroup::new(GroupKind::Background)
                .with_step(
                    "combine",
                    Step::new("ChannelCombiner").with_data("inputStepName", "left,right"),
                )
                .with_step("sink", collect("combine")),
        )
        .with_group(
            "first",
            StepGroup::new(GroupKind::Sequential).with_step("left", generator(3)),
        )
        .with_group(
            "second",
            StepGroup::new(GroupKind::Sequential).with_step("right", generator(4)),
        );

    let handle = h.runner.launch(definition, LaunchMode::Blocking).await.unwrap();
    assert_eq!(handle.status().unwrap().status, RunState::Complete);
    assert_eq!(h.collected.lock().unwrap().len(), 7);
}

#[tokio::test]
async fn test_metadata_injection_launches_group_per_record() {
    let h = harness();
    let definition = PipelineDefinition::new(PipelineKind::Once)
        .with_group(
            "drive",
            StepGroup::new(GroupKind::Sequential)
                .with_step("gen", generator(3))
                .with_step(
                    "inject",
                    Step::new("MetadataInjection")
                        .with_data("inputStepName", "gen")
                        .with_data("mdiStepGroup", "child")
                        .with_data("replacementVariableWithFieldNameCSV", "${n}:rowNumber"),
                )
                .with_step("sink", collect("inject")),
        )
        // Listed in the sequence, but only ever launched by the injection step
        .with_group(
            "child",
            StepGroup::new(GroupKind::Sequential)
                .with_step("probe", Step::new("Capture").with_data("value", "row-${n}")),
        );

    let handle = h.runner.launch(definition, LaunchMode::Blocking).await.unwrap();
    assert_eq!(handle.status().unwrap().status, RunState::Complete);

    let mut captured = h.captured.lock().unwrap().clone();
    captured.sort();
    assert_eq!(captured, vec!["row-1", "row-2", "row-3"]);

    let records = h.collected.lock().unwrap();
    assert_eq!(records.len(), 3);
    let json = records[1].get("stepGroupJson").unwrap().as_str().unwrap();
    let group: StepGroup = serde_json::from_str(json).unwrap();
    assert_eq!(group.steps["probe"].param("value"), Some("row-2"));
}

#[tokio::test]
async fn test_repeating_pipeline_runs_until_shutdown() {
    let h = harness();
    let definition = PipelineDefinition::new(PipelineKind::Repeating)
        .with_repeat_sleep(0)
        .with_group(
            "load",
            StepGroup::new(GroupKind::Sequential)
                .with_step("gen", generator(5))
                .with_step("sink", collect("gen")),
        );

    let handle = h.runner.launch(definition, LaunchMode::Background).await.unwrap();
    let collected = h.collected.clone();
    wait_until(|| collected.lock().unwrap().len() >= 15).await;
    assert!(handle.request_shutdown());

    let status = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(status.status, RunState::Shutdown);
}

#[tokio::test]
async fn test_repeating_group_runs_until_shutdown() {
    let h = harness();
    let definition = PipelineDefinition::new(PipelineKind::Once).with_group(
        "poll",
        StepGroup::new(GroupKind::Repeating)
            .with_repeat_sleep(0)
            .with_step("gen", generator(2))
            .with_step("sink", collect("gen")),
    );

    let handle = h.runner.launch(definition, LaunchMode::Background).await.unwrap();
    let collected = h.collected.clone();
    wait_until(|| collected.lock().unwrap().len() >= 6).await;
    assert!(handle.request_shutdown());

    let status = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(status.status, RunState::Shutdown);
}

#[tokio::test]
async fn test_external_failure_reports_error() {
    let h = harness();
    let definition = PipelineDefinition::new(PipelineKind::Once).with_group(
        "load",
        StepGroup::new(GroupKind::Sequential).with_step("gen", generator(u64::from(u32::MAX))),
    );

    let handle = h.runner.launch(definition, LaunchMode::Background).await.unwrap();
    wait_until(|| handle.status().map(|s| s.status) == Some(RunState::Running)).await;
    assert!(handle.fail("operator abort"));

    let status = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(status.status, RunState::CompleteWithError);
    assert_eq!(status.error.as_deref(), Some("operator abort"));
}

#[tokio::test]
async fn test_consumers_may_be_declared_before_producers() {
    let h = harness();
    let mut unordered = StepGroup::new(GroupKind::Sequential)
        .with_step("log", Step::new("StdOutLogger").with_data("inputStepName", "gen2"))
        .with_step("gen2", generator(4))
        .with_step("a_sink", collect("log"));
    unordered.sequence.clear();
    let definition = PipelineDefinition::new(PipelineKind::Once)
        .with_group(
            "listed",
            StepGroup::new(GroupKind::Sequential)
                .with_step("sink", collect("map"))
                .with_step(
                    "map",
                    Step::new("FieldMapper")
                        .with_data("inputStepName", "gen")
                        .with_sub_step(
                            Step::new("SetField")
                                .with_data("field", "source")
                                .with_data("value", "listed"),
                        ),
                )
                .with_step("gen", generator(3)),
        )
        .with_group("unordered", unordered);

    h.runner.validate(&definition).unwrap();
    let handle = h.runner.launch(definition, LaunchMode::Blocking).await.unwrap();
    let status = handle.status().unwrap();
    assert_eq!(status.status, RunState::Complete, "{:?}", status.error);
    assert_eq!(h.collected.lock().unwrap().len(), 7);
}

#[tokio::test]
async fn test_sequential_group_finishes_before_next_starts() {
    let h = harness();
    let definition = PipelineDefinition::new(PipelineKind::Once)
        .with_group(
            "first",
            StepGroup::new(GroupKind::Sequential)
                .with_step("gen", generator(2000))
                .with_step("log", Step::new("StdOutLogger").with_data("inputStepName", "gen"))
                .with_step("sink", collect("log")),
        )
        .with_group(
            "second",
            StepGroup::new(GroupKind::Sequential).with_step("tally", Step::new("Tally")),
        );

    let handle = h.runner.launch(definition, LaunchMode::Blocking).await.unwrap();
    assert_eq!(handle.status().unwrap().status, RunState::Complete);
    assert_eq!(*h.captured.lock().unwrap(), vec!["2000"]);
}

#[tokio::test]
async fn test_repeating_pipeline_sleeps_between_iterations() {
    let h = harness();
    let definition = PipelineDefinition::new(PipelineKind::Repeating)
        .with_repeat_sleep(1)
        .with_group(
            "tick",
            StepGroup::new(GroupKind::Sequential).with_step("clock", Step::new("Clock")),
        );

    let handle = h.runner.launch(definition, LaunchMode::Background).await.unwrap();
    let starts = h.starts.clone();
    wait_until(|| starts.lock().unwrap().len() >= 3).await;
    assert!(handle.request_shutdown());
    tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

    let starts = h.starts.lock().unwrap();
    for pair in starts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= Duration::from_millis(950) && gap < Duration::from_millis(1800),
            "gap between iterations was {gap:?}"
        );
    }
}
