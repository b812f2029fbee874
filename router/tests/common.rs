use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;

#[derive(Deserialize, Debug)]
pub struct Product {
    pub id: u64,
    pub weights: Vec<f32>,
    pub candidates: Vec<serde_json::Value>,
}

pub fn packed(pt: f32, eta: f32, phi: f32) -> serde_json::Value {
    json!({
        "kind": "packed",
        "pt": pt,
        "eta": eta,
        "phi": phi,
        "mass": 0.0,
        "charge": 1,
        "pdg_id": 211
    })
}

pub fn reco(px: f32, py: f32, pz: f32, energy: f32) -> serde_json::Value {
    json!({"kind": "reco", "px": px, "py": py, "pz": pz, "energy": energy})
}

pub fn event_line(id: u64, name: &str, candidates: Vec<serde_json::Value>) -> String {
    json!({"id": id, "collections": {name: candidates}}).to_string()
}

/// Unique path under the system temp directory
pub fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("abcnet-{}-{name}", std::process::id()))
}

pub fn parse_products(output: &[u8]) -> Vec<Product> {
    String::from_utf8_lossy(output)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

pub fn is_close(a: f32, b: f32) -> bool {
    is_close::default().abs_tol(1e-5).is_close(a, b)
}
