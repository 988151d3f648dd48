//! Test: malformed pipelines are rejected before anything is submitted

use crate::helpers::*;
use ml_pipeline::core::{
    OutputRef, Pipeline, PipelineConfig, ProcessingStep, ResourceSpec, TrainingStep,
};
use ml_pipeline::PipelineError;

fn preprocess() -> ProcessingStep {
    ProcessingStep::new("PreprocessIrisData", "image", ResourceSpec::new("ml.t3.medium"))
        .input("s3://bucket/iris-dataset/", "/opt/ml/processing/input")
        .output("ProcessedData", "/opt/ml/processing/output", "s3://bucket/iris-output/")
}

#[test]
fn test_undeclared_output_name_is_a_mismatch() {
    let pre = preprocess().build().unwrap();
    let err = pre.output("ProcessedDataset").unwrap_err();

    match err {
        PipelineError::OutputNameMismatch {
            source_step,
            output,
            declared,
        } => {
            assert_eq!(source_step, "PreprocessIrisData");
            assert_eq!(output, "ProcessedDataset");
            assert_eq!(declared, vec!["ProcessedData".to_string()]);
        }
        other => panic!("Expected OutputNameMismatch, got {:?}", other),
    }
}

#[test]
fn test_mismatch_is_caught_when_the_graph_is_assembled() {
    let pre = preprocess().build().unwrap();
    let train = TrainingStep::new("TrainIrisModel", "image", ResourceSpec::new("ml.c4.xlarge"))
        .channel(
            "train",
            OutputRef::processing_output("PreprocessIrisData", "Missing"),
        )
        .depends_on("PreprocessIrisData")
        .build()
        .unwrap();

    let err = Pipeline::new("iris-pipeline", vec![pre, train]).unwrap_err();
    assert!(matches!(err, PipelineError::OutputNameMismatch { ref output, .. } if output == "Missing"));
}

#[test]
fn test_mismatch_in_yaml_names_the_output() {
    let yaml = IRIS_YAML.replace("output: ProcessedData", "output: CleanData");
    let err = PipelineConfig::from_yaml(&yaml).unwrap_err();

    assert!(matches!(err, PipelineError::OutputNameMismatch { .. }));
    assert!(err.to_string().contains("CleanData"));
}

#[test]
fn test_reference_to_unknown_step_is_rejected() {
    let train = TrainingStep::new("TrainIrisModel", "image", ResourceSpec::new("ml.c4.xlarge"))
        .channel("train", OutputRef::processing_output("Ghost", "ProcessedData"))
        .build()
        .unwrap();

    let err = Pipeline::new("iris-pipeline", vec![train]).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidDefinition(_)));
    assert!(err.to_string().contains("Ghost"));
}

#[test]
fn test_forward_reference_without_dependency_is_rejected() {
    let pre = preprocess().build().unwrap();
    let train = TrainingStep::new("TrainIrisModel", "image", ResourceSpec::new("ml.c4.xlarge"))
        .channel("train", pre.output("ProcessedData").unwrap())
        .build()
        .unwrap();

    let err = Pipeline::new("iris-pipeline", vec![train, pre]).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidDefinition(_)));
}

#[test]
fn test_dependency_cycle_is_rejected() {
    let yaml = r#"
name: cyclic
steps:
  - kind: processing
    name: A
    image_uri: image
    instance_type: ml.t3.medium
    outputs:
      - output_name: Out
        destination: s3://bucket/a/
    depends_on: [B]
  - kind: processing
    name: B
    image_uri: image
    instance_type: ml.t3.medium
    outputs:
      - output_name: Out
        destination: s3://bucket/b/
    depends_on: [A]
"#;
    let err = PipelineConfig::from_yaml(yaml).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidDefinition(_)));
}

#[test]
fn test_duplicate_step_names_are_rejected() {
    let err = Pipeline::new(
        "iris-pipeline",
        vec![preprocess().build().unwrap(), preprocess().build().unwrap()],
    )
    .unwrap_err();
    assert!(err.to_string().contains("Duplicate step name"));
}

#[test]
fn test_undefined_variable_is_rejected() {
    let yaml = IRIS_YAML.replace("{{ image }}", "{{ container }}");
    let err = PipelineConfig::from_yaml(&yaml).unwrap_err();

    assert!(matches!(err, PipelineError::InvalidDefinition(_)));
    assert!(err.to_string().contains("container"));
}

#[test]
fn test_invalid_step_name_is_rejected() {
    let result = ProcessingStep::new("bad name!", "image", ResourceSpec::new("ml.t3.medium"))
        .output("Out", "/opt/ml/processing/output", "s3://bucket/out/")
        .build();
    assert!(matches!(result, Err(PipelineError::InvalidDefinition(_))));
}

#[test]
fn test_empty_pipeline_is_rejected() {
    assert!(matches!(
        Pipeline::new("iris-pipeline", Vec::new()),
        Err(PipelineError::InvalidDefinition(_))
    ));
}
