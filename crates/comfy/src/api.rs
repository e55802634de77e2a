//! REST client for the ComfyUI HTTP endpoints: workflow submission,
//! queue deletion, interrupt, history, and output retrieval.

use serde::Deserialize;

/// HTTP client for a single ComfyUI server.
pub struct ComfyApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response from `POST /prompt` after queueing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in ComfyUI's own execution queue.
    #[serde(default)]
    pub number: i32,
}

/// Errors from the ComfyUI REST layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyApiError {
    /// The HTTP request itself failed (network, DNS, TLS).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    Api { status: u16, body: String },
}

impl ComfyApi {
    /// * `api_url` - base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    /// Submit a workflow graph for execution. Returns the
    /// server-assigned `prompt_id`.
    pub async fn submit_prompt(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });
        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;
        Self::parse_json(response).await
    }

    /// Delete a queued prompt from ComfyUI's queue.
    pub async fn delete_queued(&self, prompt_id: &str) -> Result<(), ComfyApiError> {
        let body = serde_json::json!({ "delete": [prompt_id] });
        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// Interrupt whatever is executing right now. ComfyUI does not
    /// target a specific prompt here.
    pub async fn interrupt(&self) -> Result<(), ComfyApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// Execution history for a prompt: node outputs, file names, timing.
    pub async fn history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyApiError> {
        let response = self
            .client
            .get(format!("{}/history/{prompt_id}", self.api_url))
            .send()
            .await?;
        Self::parse_json(response).await
    }

    /// Upload an init image so a workflow can reference it by name.
    /// Returns the server-side file name (which may differ from the
    /// requested one on collision).
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<String, ComfyApiError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("image/png")?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("type", "input");
        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await?;
        let body: serde_json::Value = Self::parse_json(response).await?;
        Ok(body
            .get("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(filename)
            .to_string())
    }

    /// Fetch an output image by its history coordinates.
    pub async fn view(
        &self,
        filename: &str,
        subfolder: &str,
        folder_type: &str,
    ) -> Result<Vec<u8>, ComfyApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", filename),
                ("subfolder", subfolder),
                ("type", folder_type),
            ])
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyApiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<(), ComfyApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}
