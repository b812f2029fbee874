mod common;

use crate::common::{event_line, is_close, packed, parse_products, reco, temp_path};
use abcnet_backend::{Backend, BackendError, CoreBackend, ModelInputs, WeightSource, Weights};
use abcnet_core::AbcNetError;
use abcnet_core::infer::{Infer, InferConfig};
use abcnet_router::{process_events, run, RouterError};

const CAND_NAME: &str = "packedPFCandidates";

fn infer(n_pf_cands: usize) -> Infer {
    let backend = Backend::new(WeightSource::Random, None, 100).unwrap();
    Infer::new(
        backend,
        InferConfig {
            n_pf_cands,
            n_knn: 2,
            ..Default::default()
        },
    )
    .unwrap()
}

fn events() -> String {
    [
        event_line(
            1,
            CAND_NAME,
            vec![packed(10.0, 0.0, 0.0), packed(30.0, 1.0, 0.0), packed(10.0, 0.0, 0.3)],
        ),
        String::new(),
        event_line(2, CAND_NAME, vec![]),
        event_line(3, CAND_NAME, vec![packed(2.0, -1.5, 3.1)]),
    ]
    .join("\n")
}

#[tokio::test]
async fn test_process_events() {
    let infer = infer(16);
    let input = events();
    let mut output = Vec::new();

    let summary = process_events(&infer, CAND_NAME, input.as_bytes(), &mut output)
        .await
        .unwrap();
    assert_eq!(summary.events, 3);
    assert_eq!(summary.candidates, 4);

    let products = parse_products(&output);
    assert_eq!(products.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 2, 3]);

    let first = &products[0];
    assert_eq!(first.weights.len(), 3);
    assert_eq!(first.candidates.len(), 3);
    assert!(first.weights.iter().all(|w| (0.0..=1.0).contains(w)));
    let pt = first.candidates[1]["pt"].as_f64().unwrap() as f32;
    assert!(is_close(pt, 30.0 * first.weights[1]));
    assert_eq!(first.candidates[1]["eta"].as_f64(), Some(1.0));
    assert_eq!(first.candidates[1]["pdg_id"].as_i64(), Some(211));

    assert!(products[1].weights.is_empty());
    assert_eq!(products[2].weights.len(), 1);
}

#[tokio::test]
async fn test_overflow_weight_in_products() {
    let infer = infer(1);
    let input = event_line(5, CAND_NAME, vec![packed(1.0, 0.0, 0.0), packed(2.0, 0.5, 0.5)]);
    let mut output = Vec::new();

    process_events(&infer, CAND_NAME, input.as_bytes(), &mut output)
        .await
        .unwrap();

    let products = parse_products(&output);
    assert_eq!(products[0].weights.len(), 2);
    assert_eq!(products[0].weights[1], 0.0);
    assert_eq!(products[0].candidates[1]["pt"].as_f64(), Some(0.0));
}

#[tokio::test]
async fn test_reco_candidate_is_fatal() {
    let infer = infer(16);
    let input = [
        event_line(1, CAND_NAME, vec![packed(1.0, 0.0, 0.0)]),
        event_line(2, CAND_NAME, vec![packed(1.0, 0.0, 0.0), reco(1.0, 0.0, 0.0, 1.0)]),
        event_line(3, CAND_NAME, vec![packed(1.0, 0.0, 0.0)]),
    ]
    .join("\n");
    let mut output = Vec::new();

    let err = process_events(&infer, CAND_NAME, input.as_bytes(), &mut output)
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::AbcNet(_)));
    assert!(err.to_string().contains("candidate 1 is not a packed candidate"));

    // Only the event before the failure was written
    let products = parse_products(&output);
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].id, 1);
}

/// Engine that drops one weight for events larger than two candidates
struct TruncatingBackend;

impl CoreBackend for TruncatingBackend {
    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn predict(&self, inputs: ModelInputs) -> Result<Weights, BackendError> {
        let n = match inputs.n_candidates > 2 {
            true => inputs.n_candidates - 1,
            false => inputs.n_candidates,
        };
        Ok(vec![1.0; n])
    }
}

#[tokio::test]
async fn test_wrong_weight_count_stops_job() {
    let backend = Backend::from_backend(Box::new(TruncatingBackend), WeightSource::Model);
    let infer = Infer::new(
        backend,
        InferConfig {
            n_pf_cands: 16,
            n_knn: 2,
            ..Default::default()
        },
    )
    .unwrap();
    let mut output = Vec::new();

    let err = process_events(&infer, CAND_NAME, events().as_bytes(), &mut output)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RouterError::AbcNet(AbcNetError::Backend(BackendError::Inference(_)))
    ));
    assert!(output.is_empty());
    infer.shutdown();
}

#[tokio::test]
async fn test_missing_collection() {
    let infer = infer(16);
    let input = event_line(1, "slimmedElectrons", vec![packed(1.0, 0.0, 0.0)]);
    let mut output = Vec::new();

    let err = process_events(&infer, CAND_NAME, input.as_bytes(), &mut output)
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::MissingCollection(name) if name == CAND_NAME));
    assert!(output.is_empty());
}

#[tokio::test]
async fn test_invalid_event_line() {
    let infer = infer(16);
    let input = format!("{}\n{{\"id\": 2", event_line(1, CAND_NAME, vec![]));
    let mut output = Vec::new();

    let err = process_events(&infer, CAND_NAME, input.as_bytes(), &mut output)
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::InvalidEvent { line: 2, .. }));
}

#[tokio::test]
async fn test_run_end_to_end() {
    let input = temp_path("events.jsonl");
    let output = temp_path("products.jsonl");
    tokio::fs::write(&input, events()).await.unwrap();

    let summary = run(
        input.clone(),
        output.to_string_lossy().to_string(),
        CAND_NAME.to_string(),
        WeightSource::Random,
        None,
        100,
        InferConfig {
            n_pf_cands: 16,
            n_knn: 2,
            ..Default::default()
        },
        None,
    )
    .await
    .unwrap();
    assert_eq!(summary.events, 3);

    let products = parse_products(&tokio::fs::read(&output).await.unwrap());
    assert_eq!(products.len(), 3);

    // Same seed, same weights
    let second = temp_path("products-2.jsonl");
    run(
        input.clone(),
        second.to_string_lossy().to_string(),
        CAND_NAME.to_string(),
        WeightSource::Random,
        None,
        100,
        InferConfig {
            n_pf_cands: 16,
            n_knn: 2,
            ..Default::default()
        },
        None,
    )
    .await
    .unwrap();
    let again = parse_products(&tokio::fs::read(&second).await.unwrap());
    assert_eq!(products[0].weights, again[0].weights);

    for path in [input, output, second] {
        let _ = tokio::fs::remove_file(path).await;
    }
}

#[tokio::test]
async fn test_run_missing_input() {
    let result = run(
        temp_path("does-not-exist.jsonl"),
        "-".to_string(),
        CAND_NAME.to_string(),
        WeightSource::Random,
        None,
        100,
        InferConfig::default(),
        None,
    )
    .await;
    assert!(result.is_err());
}
