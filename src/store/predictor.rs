// =============================================================================
// Predictor Client — optional external confidence/P&L predictor
// =============================================================================
//
// When configured, the coordinator attaches the predictor's view to the
// response rationale as advisory context. When the predictor is absent or
// unreachable nothing is fabricated; the evaluation proceeds without it.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::types::Direction;

/// Predicted P&L distribution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PnlForecast {
    pub mean: f64,
    pub std: f64,
}

/// Predictor-suggested risk parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskForecast {
    pub suggested_sl: f64,
    pub suggested_tp: f64,
}

/// Full predictor output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub confidence: f64,
    pub pnl: PnlForecast,
    pub risk: RiskForecast,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictRequest<'a> {
    instrument: &'a str,
    direction: Direction,
    features: &'a HashMap<String, f64>,
}

/// HTTP client for the optional external predictor.
#[derive(Clone)]
pub struct PredictorClient {
    base_url: String,
    client: reqwest::Client,
}

impl PredictorClient {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// POST /predict — synchronous prediction for a live feature set.
    #[instrument(skip(self, features), name = "predictor::predict")]
    pub async fn predict(
        &self,
        instrument: &str,
        direction: Direction,
        features: &HashMap<String, f64>,
    ) -> Result<Prediction> {
        let url = format!("{}/predict", self.base_url);
        let req = PredictRequest {
            instrument,
            direction,
            features,
        };

        let resp = self
            .client
            .post(&url)
            .json(&req)
            .send()
            .await
            .context("POST /predict request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("predictor POST /predict returned {}", status);
        }

        let prediction: Prediction = resp
            .json()
            .await
            .context("failed to parse predictor response")?;

        debug!(
            instrument,
            confidence = prediction.confidence,
            pnl_mean = prediction.pnl.mean,
            "prediction received"
        );
        Ok(prediction)
    }
}
