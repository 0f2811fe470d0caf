use drover_cluster::{TaskDescriptor, TaskKind, TaskOutcome};
use drover_core::model::RunId;
use drover_core::record::{Fingerprint, RecordStore};
use drover_core::state::{ComponentId, ComponentState, RunState};
use drover_sandbox::{Action, Sandbox};
use drover_test_utils::{linear_pipeline, TestContext};
use std::fs;
use std::path::PathBuf;

/// Plays the role of the cluster: runs one task "by hand". Cables copy
/// their file; steps write outputs derived deterministically from their
/// inputs, so identical inputs give identical outputs across runs.
fn execute_task(task: &TaskDescriptor, fail_markers: &[&str]) -> TaskOutcome {
    task.prepare().unwrap();
    if fail_markers.iter().any(|m| task.id.0.contains(m)) {
        return TaskOutcome { exit_code: 3 };
    }
    match task.kind {
        TaskKind::Cable => {
            fs::copy(&task.inputs[0], &task.outputs[0]).unwrap();
        }
        TaskKind::Step => {
            let mut content = format!("{}\n", task.component);
            for input in &task.inputs {
                content.push_str(&fs::read_to_string(input).unwrap());
            }
            for output in &task.outputs {
                fs::write(output, &content).unwrap();
            }
        }
    }
    TaskOutcome { exit_code: 0 }
}

/// Drives a sandbox to a terminal state, executing dispatched tasks
/// immediately. Returns the number of fresh executions that happened.
fn drive(sandbox: &mut Sandbox, fail_markers: &[&str]) -> (usize, RunState) {
    let mut executions = 0;
    for _ in 0..64 {
        let actions = sandbox.startable_tasks().unwrap();
        let idle = actions.is_empty();
        for action in actions {
            match action {
                Action::Dispatch(task) => {
                    executions += 1;
                    let outcome = execute_task(&task, fail_markers);
                    sandbox.finish_task(task.component, &outcome).unwrap();
                }
                Action::SpawnChild { .. } => panic!("unexpected sub-pipeline step"),
            }
        }
        let state = sandbox.advance().unwrap();
        if state.is_terminal() {
            return (executions, state);
        }
        if idle {
            break;
        }
    }
    (executions, sandbox.run().state)
}

fn make_sandbox(ctx: &TestContext, pipeline_id: &str, steps: usize, input: &PathBuf) -> Sandbox {
    Sandbox::create(
        RunId::generate(),
        linear_pipeline(pipeline_id, steps),
        std::slice::from_ref(input),
        "alice".to_string(),
        &ctx.sandbox_root,
        ctx.registry.clone(),
        ctx.store.clone(),
    )
    .unwrap()
}

#[test]
fn test_two_step_pipeline_succeeds() {
    let ctx = TestContext::new();
    let input = ctx.write_input("data.txt", "raw reads\n");
    let mut sandbox = make_sandbox(&ctx, "pl", 2, &input);

    assert_eq!(sandbox.run().state, RunState::Pending);
    let (executions, state) = drive(&mut sandbox, &[]);

    assert_eq!(state, RunState::Successful);
    // cable 0, step 0, cable 1, step 1, output cable: all fresh.
    assert_eq!(executions, 5);
    assert!(sandbox
        .run()
        .components
        .iter()
        .all(|c| c.state == ComponentState::Successful && !c.reused));
    assert_eq!(sandbox.run().render_progress(), "*****");

    let result = sandbox.layout().root().join("outputs/result");
    assert!(result.exists(), "pipeline output must be materialized");

    // One record per component.
    for component in &sandbox.run().components {
        let fp = Fingerprint(component.fingerprint.clone().unwrap());
        assert!(matches!(
            ctx.store.lookup(&fp).unwrap(),
            drover_core::record::RecordLookup::Complete(_)
        ));
    }
}

#[test]
fn test_failed_step_blocks_downstream_forever() {
    let ctx = TestContext::new();
    let input = ctx.write_input("data.txt", "raw\n");
    let mut sandbox = make_sandbox(&ctx, "pl-fail", 2, &input);

    // "step 0" is the failing component's task id marker.
    let (executions, state) = drive(&mut sandbox, &["step 0"]);

    assert_eq!(state, RunState::Failed);
    // cable 0 ran, step 0 ran and failed; nothing downstream dispatched.
    assert_eq!(executions, 2);

    let run = sandbox.run();
    assert_eq!(
        run.component(ComponentId::Step { step: 0 }).unwrap().state,
        ComponentState::Failed
    );
    assert_eq!(
        run.component(ComponentId::Step { step: 1 }).unwrap().state,
        ComponentState::Pending,
        "dependents of a failure stay pending forever"
    );
    assert_eq!(
        run.component(ComponentId::InputCable { step: 1, cable: 0 })
            .unwrap()
            .state,
        ComponentState::Pending
    );
    assert_eq!(run.render_progress(), "*!...");
}

#[test]
fn test_second_identical_run_reuses_everything() {
    let ctx = TestContext::new();
    let input = ctx.write_input("data.txt", "raw reads\n");

    let mut first = make_sandbox(&ctx, "pl", 2, &input);
    let (first_executions, state) = drive(&mut first, &[]);
    assert_eq!(state, RunState::Successful);
    assert_eq!(first_executions, 5);

    let mut second = make_sandbox(&ctx, "pl", 2, &input);
    let (second_executions, state) = drive(&mut second, &[]);

    assert_eq!(state, RunState::Successful);
    assert_eq!(second_executions, 0, "no fresh execution on an identical rerun");
    assert!(second
        .run()
        .components
        .iter()
        .all(|c| c.state == ComponentState::Successful && c.reused));
    assert_eq!(second.run().render_progress(), "=====");
}

#[test]
fn test_recorded_failure_is_reused_without_rerunning() {
    let ctx = TestContext::new();
    let input = ctx.write_input("data.txt", "raw\n");

    let mut first = make_sandbox(&ctx, "pl-f", 1, &input);
    let (_, state) = drive(&mut first, &["step 0"]);
    assert_eq!(state, RunState::Failed);

    let mut second = make_sandbox(&ctx, "pl-f", 1, &input);
    let (executions, state) = drive(&mut second, &[]);
    assert_eq!(state, RunState::Failed);
    assert_eq!(executions, 0, "the recorded failure satisfies the lookup");
    let step = second
        .run()
        .component(ComponentId::Step { step: 0 })
        .unwrap();
    assert_eq!(step.state, ComponentState::Failed);
    assert!(step.reused);
}

#[test]
fn test_concurrent_identical_runs_collapse_to_one_execution() {
    let ctx = TestContext::new();
    let input = ctx.write_input("data.txt", "raw\n");

    let mut first = make_sandbox(&ctx, "pl", 1, &input);
    let mut second = make_sandbox(&ctx, "pl", 1, &input);

    // First run claims the cable's fingerprint.
    let actions = first.startable_tasks().unwrap();
    assert_eq!(actions.len(), 1);

    // Second run sees the claim and must wait, not execute.
    assert!(second.startable_tasks().unwrap().is_empty());
    assert_eq!(
        second
            .run()
            .component(ComponentId::InputCable { step: 0, cable: 0 })
            .unwrap()
            .state,
        ComponentState::Pending
    );

    // Drive the first run to completion, then the second: it reuses all.
    for action in actions {
        if let Action::Dispatch(task) = action {
            let outcome = execute_task(&task, &[]);
            first.finish_task(task.component, &outcome).unwrap();
        }
    }
    let (first_rest, state) = drive(&mut first, &[]);
    assert_eq!(state, RunState::Successful);

    let (second_executions, state) = drive(&mut second, &[]);
    assert_eq!(state, RunState::Successful);
    assert_eq!(second_executions, 0);
    // Exactly one fresh execution per component across both runs.
    assert_eq!(1 + first_rest, 3);
}

#[test]
fn test_purged_dataset_triggers_regeneration() {
    let ctx = TestContext::new();
    let input = ctx.write_input("data.txt", "raw reads\n");

    let mut first = make_sandbox(&ctx, "pl", 1, &input);
    let (_, state) = drive(&mut first, &[]);
    assert_eq!(state, RunState::Successful);

    // Purge the step's output dataset; its record survives.
    let step_fp = Fingerprint(
        first
            .run()
            .component(ComponentId::Step { step: 0 })
            .unwrap()
            .fingerprint
            .clone()
            .unwrap(),
    );
    let record = match ctx.store.lookup(&step_fp).unwrap() {
        drover_core::record::RecordLookup::Complete(r) => r,
        other => panic!("expected record, got {:?}", other),
    };
    for out in &record.outputs {
        ctx.registry.remove(&out.dataset).unwrap();
    }

    let mut second = make_sandbox(&ctx, "pl", 1, &input);
    let (executions, state) = drive(&mut second, &[]);
    assert_eq!(state, RunState::Successful);
    // The cable reuses; the step regenerates its purged output, and since
    // regeneration restores the same content hash, the output cable can
    // reuse again.
    assert_eq!(executions, 1, "only the purged step re-runs");
    let step = second
        .run()
        .component(ComponentId::Step { step: 0 })
        .unwrap();
    assert!(!step.reused);
    assert_eq!(step.state, ComponentState::Successful);
}

#[test]
fn test_recovery_regenerates_transitively() {
    let ctx = TestContext::new();
    let input = ctx.write_input("data.txt", "raw reads\n");

    let mut first = make_sandbox(&ctx, "pl", 2, &input);
    let (_, state) = drive(&mut first, &[]);
    assert_eq!(state, RunState::Successful);

    // Purge every intermediate dataset; only records and the run input
    // survive.
    for id in [ComponentId::Step { step: 0 }, ComponentId::Step { step: 1 }] {
        let fp = Fingerprint(
            first
                .run()
                .component(id)
                .unwrap()
                .fingerprint
                .clone()
                .unwrap(),
        );
        let record = match ctx.store.lookup(&fp).unwrap() {
            drover_core::record::RecordLookup::Complete(r) => r,
            other => panic!("expected record, got {:?}", other),
        };
        for out in &record.outputs {
            ctx.registry.remove(&out.dataset).unwrap();
        }
    }

    // The second run regenerates both steps (each needing the one before
    // it), while both cables and the output cable reuse their records.
    let mut second = make_sandbox(&ctx, "pl", 2, &input);
    let (executions, state) = drive(&mut second, &[]);
    assert_eq!(state, RunState::Successful);
    assert_eq!(executions, 2, "exactly the two purged steps re-run");
    for step in 0..2 {
        let component = second
            .run()
            .component(ComponentId::Step { step })
            .unwrap();
        assert_eq!(component.state, ComponentState::Successful);
        assert!(!component.reused, "a regenerated step is not a reuse");
    }
}

#[test]
fn test_unrecoverable_run_input_fails_the_run() {
    let ctx = TestContext::new();
    let input = ctx.write_input("data.txt", "raw\n");

    let mut first = make_sandbox(&ctx, "pl-gone", 1, &input);
    let (_, state) = drive(&mut first, &[]);
    assert_eq!(state, RunState::Successful);

    // A third party quarantines the cable's record (forcing fresh
    // execution) while the staged input and its registry copy are gone.
    let cable_fp = Fingerprint(
        first
            .run()
            .component(ComponentId::InputCable { step: 0, cable: 0 })
            .unwrap()
            .fingerprint
            .clone()
            .unwrap(),
    );
    ctx.store.set_quarantined(&cable_fp, true).unwrap();

    let mut second = make_sandbox(&ctx, "pl-gone", 1, &input);
    let input_hash = second.run().inputs[0].clone();
    fs::remove_file(second.layout().root().join("inputs/0_data")).unwrap();
    ctx.registry.remove(&input_hash).unwrap();

    let (_, state) = drive(&mut second, &[]);
    assert_eq!(state, RunState::Failed);
    assert!(matches!(
        second.run().condition,
        Some(drover_core::state::RunCondition::RecoveryFailed { .. })
    ));
}

#[test]
fn test_quarantined_record_is_not_reused() {
    let ctx = TestContext::new();
    let input = ctx.write_input("data.txt", "raw\n");

    let mut first = make_sandbox(&ctx, "pl", 1, &input);
    let (_, state) = drive(&mut first, &[]);
    assert_eq!(state, RunState::Successful);

    let step_fp = Fingerprint(
        first
            .run()
            .component(ComponentId::Step { step: 0 })
            .unwrap()
            .fingerprint
            .clone()
            .unwrap(),
    );
    ctx.store.set_quarantined(&step_fp, true).unwrap();

    let mut second = make_sandbox(&ctx, "pl", 1, &input);
    let (executions, state) = drive(&mut second, &[]);
    assert_eq!(state, RunState::Successful);
    assert!(executions >= 1, "quarantined record must not satisfy reuse");
    let step = second
        .run()
        .component(ComponentId::Step { step: 0 })
        .unwrap();
    assert!(!step.reused);
}

#[test]
fn test_invalid_pipeline_fails_immediately() {
    let ctx = TestContext::new();
    let input = ctx.write_input("data.txt", "raw\n");

    let mut pipeline = linear_pipeline("pl-bad", 2);
    pipeline.steps[1].cables.clear(); // step 1's input now has no source

    let mut sandbox = Sandbox::create(
        RunId::generate(),
        pipeline,
        &[input],
        "alice".to_string(),
        &ctx.sandbox_root,
        ctx.registry.clone(),
        ctx.store.clone(),
    )
    .unwrap();

    assert_eq!(sandbox.run().state, RunState::Failed);
    assert!(matches!(
        sandbox.run().condition,
        Some(drover_core::state::RunCondition::InvalidPipeline { .. })
    ));
    assert!(sandbox.startable_tasks().unwrap().is_empty());
}

#[test]
fn test_cancel_stops_new_dispatch() {
    let ctx = TestContext::new();
    let input = ctx.write_input("data.txt", "raw\n");
    let mut sandbox = make_sandbox(&ctx, "pl-cancel", 2, &input);

    // Start the first cable, then cancel with it still in flight.
    let actions = sandbox.startable_tasks().unwrap();
    assert_eq!(actions.len(), 1);
    sandbox.cancel().unwrap();

    assert!(sandbox.startable_tasks().unwrap().is_empty());
    assert_eq!(sandbox.advance().unwrap(), RunState::Cancelling);

    // The in-flight task drains; only then does the run reach Cancelled.
    for action in actions {
        if let Action::Dispatch(task) = action {
            let outcome = execute_task(&task, &[]);
            sandbox.finish_task(task.component, &outcome).unwrap();
        }
    }
    assert_eq!(sandbox.advance().unwrap(), RunState::Cancelled);
}

#[test]
fn test_run_json_round_trips() {
    let ctx = TestContext::new();
    let input = ctx.write_input("data.txt", "raw\n");
    let mut sandbox = make_sandbox(&ctx, "pl-persist", 1, &input);
    let (_, state) = drive(&mut sandbox, &[]);
    assert_eq!(state, RunState::Successful);

    let loaded =
        drover_core::state::Run::load(&sandbox.layout().root().join("run.json")).unwrap();
    assert_eq!(loaded.id, sandbox.run().id);
    assert_eq!(loaded.state, RunState::Successful);
    assert_eq!(loaded.components.len(), sandbox.run().components.len());
    assert_eq!(loaded.owner, "alice");
}
