use block_engine::{
    progress_channel, BlockDefinitionCatalog, BlockEngine, EngineConfig, ExecutionEvent,
    RunBlockRequest, RuntimeRegistry,
};
use tracing_subscriber::EnvFilter;

const CATALOG: &str = r#"
- kind: basic
  id: Add
  variables:
    - name: X
      dataType: int32
    - name: Y
      dataType: int32
    - name: Result
      dataType: int32
      variableType: output
  events:
    - name: Start
      isInput: true
      variables: [X, Y]
    - name: Completed
  functions:
    - id: compute
      source: "Result = X + Y"
  executionControlChart:
    initialState: Idle
    states:
      - name: Idle
    transitions:
      - fromState: Idle
        toState: Idle
        triggerEvent: Start
        actions: [compute]
        defaultOutputEvents: [Completed]

- kind: basic
  id: Delay
  variables:
    - name: DelayMs
      dataType: int32
  events:
    - name: Start
      isInput: true
      variables: [DelayMs]
    - name: Done
  functions:
    - id: wait
      source: "delay(DelayMs)"
  executionControlChart:
    initialState: Idle
    states:
      - name: Idle
    transitions:
      - fromState: Idle
        toState: Idle
        triggerEvent: Start
        actions: [wait]
        defaultOutputEvents: [Done]

- kind: composite
  id: DependencyWait
  variables:
    - name: DelayMs
      dataType: int32
    - name: Add1X
      dataType: int32
    - name: Add1Y
      dataType: int32
    - name: Add2X
      dataType: int32
    - name: Add2Y
      dataType: int32
    - name: Result
      dataType: int32
      variableType: output
  events:
    - name: Start
      isInput: true
    - name: Completed
  blocks:
    - id: Wait
      definitionId: Delay
    - id: Add1
      definitionId: Add
    - id: Add2
      definitionId: Add
    - id: Add3
      definitionId: Add
  eventConnections:
    - { sourceEvent: Start, targetBlockId: Wait, targetEvent: Start }
    - { sourceEvent: Start, targetBlockId: Add1, targetEvent: Start }
    - { sourceBlockId: Wait, sourceEvent: Done, targetBlockId: Add2, targetEvent: Start }
    - { sourceBlockId: Add1, sourceEvent: Completed, targetBlockId: Add3, targetEvent: Start }
    - { sourceBlockId: Add2, sourceEvent: Completed, targetBlockId: Add3, targetEvent: Start }
    - { sourceBlockId: Add3, sourceEvent: Completed, targetEvent: Completed }
  dataConnections:
    - { sourceVariable: DelayMs, targetBlockId: Wait, targetVariable: DelayMs }
    - { sourceVariable: Add1X, targetBlockId: Add1, targetVariable: X }
    - { sourceVariable: Add1Y, targetBlockId: Add1, targetVariable: Y }
    - { sourceVariable: Add2X, targetBlockId: Add2, targetVariable: X }
    - { sourceVariable: Add2Y, targetBlockId: Add2, targetVariable: Y }
    - { sourceBlockId: Add1, sourceVariable: Result, targetBlockId: Add3, targetVariable: X }
    - { sourceBlockId: Add2, sourceVariable: Result, targetBlockId: Add3, targetVariable: Y }
    - { sourceBlockId: Add3, sourceVariable: Result, targetVariable: Result }
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("block_engine=debug")),
        )
        .init();

    let mut catalog = BlockDefinitionCatalog::from_yaml_str(CATALOG)?;
    catalog.map_definitions()?;
    println!("✓ Mapped {} definitions", catalog.len());

    let (tx, mut rx) = progress_channel();
    let engine = BlockEngine::new(catalog, RuntimeRegistry::new())
        .with_config(EngineConfig {
            default_timeout_ms: Some(10_000),
            ..Default::default()
        })
        .with_progress(tx);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ExecutionEvent::SubBlockLaunched { instance, event, .. } => {
                    println!("  → {} on {}", instance, event)
                }
                ExecutionEvent::BlockCompleted { block, duration, .. } => {
                    println!("  ✓ {} ({:?})", block, duration)
                }
                ExecutionEvent::BlockFailed { block, error, .. } => {
                    println!("  ✗ {}: {}", block, error)
                }
                _ => {}
            }
        }
    });

    let control = engine.create_control("DependencyWait")?;
    let request = RunBlockRequest::new()
        .with_input("DelayMs", 3000)
        .with_input("Add1X", 1)
        .with_input("Add1Y", 2)
        .with_input("Add2X", 3)
        .with_input("Add2Y", 4);

    println!("\n🚀 Running DependencyWait...\n");
    let outcome = engine.run(&control, request).await;

    if let Some(activity) = &outcome.activity {
        println!("\n{}", activity);
    }
    match outcome.result {
        Ok(result) => println!("\nOutput events: {:?}", result.output_events),
        Err(error) => println!("\nRun failed: {}", error),
    }
    println!("Outputs: {:?}", outcome.outputs);

    drop(control);
    drop(engine);
    printer.await?;
    Ok(())
}
