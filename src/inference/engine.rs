//! Inference orchestrator: drives prefill and decode through a per-request
//! [`ShadowKvStack`], the role the teacher's pager/block tiering played for
//! its own KV representation.
//!
//! The engine is the top-level component that:
//! 1. Receives tokenized prompts
//! 2. Builds a fresh `ShadowKvStack` for the request and runs prefill (§4.1-§4.4)
//! 3. Drives the decode loop (one token at a time), retrieving and
//!    reconstructing through the cache at each step (§4.5) and appending the
//!    newly generated position (§4.6)
//! 4. Returns generated tokens via a streaming channel
//!
//! The cache is "transient to a single generation session" (§6), so each
//! call to [`InferenceEngine::generate`] owns its stack outright rather than
//! sharing one across requests.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cache::shadow_cache::ShadowKvStack;
use crate::config::Config;
use crate::inference::attention_kernel::{self, TokenId};

/// A generation request.
#[derive(Debug)]
pub struct GenerationRequest {
    /// Unique request ID.
    pub request_id: String,

    /// Input token IDs (prompt).
    pub prompt_tokens: Vec<TokenId>,

    /// Maximum tokens to generate.
    pub max_tokens: usize,

    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f64,

    /// Top-p (nucleus) sampling threshold.
    pub top_p: f64,

    /// Stop sequences (as token IDs).
    pub stop_tokens: Vec<TokenId>,
}

/// A generated token event.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// A new token was generated.
    Token { token_id: TokenId, text: String },
    /// Generation is complete.
    Done {
        total_tokens: usize,
        prompt_tokens: usize,
        completion_tokens: usize,
    },
    /// An error occurred during generation.
    Error(String),
}

/// The inference engine.
pub struct InferenceEngine {
    config: Arc<Config>,
    next_request_seq: u64,
}

impl InferenceEngine {
    /// Create a new inference engine.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            next_request_seq: 0,
        }
    }

    /// Run a generation request, streaming tokens to the returned receiver.
    ///
    /// This is the main entry point for inference. It:
    /// 1. Builds a single-sequence `ShadowKvStack` sized from `config.model`
    /// 2. Prefills every layer from a synthetic projection of the prompt
    ///    (the crate owns no tokenizer or model weights; see
    ///    [`attention_kernel::synthetic_projection`])
    /// 3. Generates tokens one at a time, driving retrieval, reconstruction,
    ///    and append through the cache at every step
    pub async fn generate(&mut self, request: GenerationRequest) -> mpsc::Receiver<GenerationEvent> {
        let (tx, rx) = mpsc::channel(32);

        let seq = self.next_request_seq;
        self.next_request_seq += 1;

        let config = self.config.clone();
        let max_tokens = request.max_tokens;
        let prompt_len = request.prompt_tokens.len();

        tokio::spawn(async move {
            info!(
                request_id = request.request_id,
                seq,
                prompt_tokens = prompt_len,
                max_tokens,
                "Starting generation"
            );

            if prompt_len == 0 {
                let _ = tx
                    .send(GenerationEvent::Error("prompt must contain at least one token".to_string()))
                    .await;
                return;
            }

            let model = &config.model;
            let mut shadow_cfg = config.shadow.clone();
            shadow_cfg.batch_size = 1;
            let shadow_cfg = Arc::new(shadow_cfg);

            let mut stack = ShadowKvStack::new(shadow_cfg.clone(), model.n_layers, model.n_kv_heads, model.head_dim);

            let max_position = (prompt_len + max_tokens + 1).max(shadow_cfg.chunk_size);
            let cos_sin = attention_kernel::build_cos_sin_cache(max_position, model.head_dim, 10_000.0);

            let k_pre_rope = attention_kernel::synthetic_projection(&request.prompt_tokens, model.n_kv_heads, model.head_dim, 0);
            let k_post_rope = attention_kernel::apply_rope_tensor(&k_pre_rope, &cos_sin);
            let v = attention_kernel::synthetic_projection(&request.prompt_tokens, model.n_kv_heads, model.head_dim, 1);

            for layer_idx in 0..model.n_layers {
                let layer = stack.layer_mut(layer_idx);
                if let Err(err) = layer.prefill_kv_cache(k_post_rope.view(), k_pre_rope.view(), v.view()) {
                    warn!(layer = layer_idx, error = %err, "prefill failed");
                    let _ = tx.send(GenerationEvent::Error(format!("prefill failed: {err}"))).await;
                    return;
                }
            }

            let rope_apply = |row: ndarray::ArrayView1<f32>, pos: usize, cs: &crate::cache::shadow_cache::CosSinCache| {
                attention_kernel::rope_rotate(row, pos, cs)
            };

            let mut generated = 0usize;
            let mut last_token = *request.prompt_tokens.last().unwrap();

            for step in 0..max_tokens {
                let decode_pos = prompt_len + step;
                let query_tokens = [last_token];
                let query_tensor = attention_kernel::synthetic_projection(&query_tokens, model.n_kv_heads, model.head_dim, 2);
                let query_pre_rope = query_tensor.slice(ndarray::s![0, .., 0, ..]).to_owned();

                let step_v = attention_kernel::synthetic_projection(&query_tokens, model.n_kv_heads, model.head_dim, 1);

                // Every layer's retrieval this step advances through the same
                // copy/reconstruct/barrier choreography (§4.7, §5).
                let generation = stack.begin_decode_step();

                let mut token_id = 0i32;
                for layer_idx in 0..model.n_layers {
                    for kv_head in 0..model.n_kv_heads {
                        let query_post_rope = attention_kernel::rope_rotate(query_pre_rope.row(kv_head), decode_pos, &cos_sin);
                        let query_view = query_post_rope.view().insert_axis(ndarray::Axis(0));

                        let positions = match stack.layer_mut(layer_idx).get_retrieval_position_ids(0, kv_head, query_view) {
                            Ok(p) => p,
                            Err(err) => {
                                warn!(layer = layer_idx, kv_head, error = %err, "retrieval failed");
                                let _ = tx.send(GenerationEvent::Error(format!("retrieval failed: {err}"))).await;
                                return;
                            }
                        };

                        let values = match stack.layer_mut(layer_idx).fetch_values(0, kv_head, &positions) {
                            Ok(v) => v,
                            Err(err) => {
                                let _ = tx.send(GenerationEvent::Error(format!("value fetch failed: {err}"))).await;
                                return;
                            }
                        };
                        let keys = match stack.layer_mut(layer_idx).fetch_keys(0, kv_head, &positions, &cos_sin, &rope_apply) {
                            Ok(k) => k,
                            Err(err) => {
                                let _ = tx.send(GenerationEvent::Error(format!("key fetch failed: {err}"))).await;
                                return;
                            }
                        };

                        // Stage this layer/kv_head's gathered values and
                        // reconstructed keys through the copy and
                        // reconstruction streams, then wait on the primary
                        // stream's barrier before the attention kernel reads
                        // them (§4.5 step 5, §4.7, §9).
                        if let Err(err) = stack.stage_value_stream(generation, &positions, &values).await {
                            let _ = tx.send(GenerationEvent::Error(format!("value stream stage failed: {err}"))).await;
                            return;
                        }
                        if let Err(err) = stack.stage_key_stream(generation, &positions, &keys).await {
                            let _ = tx.send(GenerationEvent::Error(format!("key stream stage failed: {err}"))).await;
                            return;
                        }
                        if let Err(err) = stack.barrier(generation) {
                            let _ = tx.send(GenerationEvent::Error(format!("stream barrier failed: {err}"))).await;
                            return;
                        }

                        let context = attention_kernel::dense_attention(query_view, keys.view(), values.view());
                        let score: f32 = context.iter().sum();
                        token_id ^= (score.to_bits() as i32).wrapping_add((layer_idx * model.n_kv_heads + kv_head) as i32);

                        let new_k_pre = query_pre_rope.row(kv_head).to_owned();
                        let new_k_post = attention_kernel::rope_rotate(new_k_pre.view(), decode_pos, &cos_sin);
                        let new_v = step_v.slice(ndarray::s![0, kv_head, 0, ..]).to_owned();

                        if let Err(err) = stack.layer_mut(layer_idx).update(0, kv_head, new_k_post.view(), new_v.view()) {
                            let _ = tx.send(GenerationEvent::Error(format!("update failed: {err}"))).await;
                            return;
                        }
                    }
                }

                let token_id = token_id.rem_euclid(100);
                let text = format!("token_{token_id}");
                last_token = token_id;
                generated += 1;

                if tx
                    .send(GenerationEvent::Token { token_id, text })
                    .await
                    .is_err()
                {
                    break;
                }

                if request.stop_tokens.contains(&token_id) {
                    break;
                }
            }

            let _ = tx
                .send(GenerationEvent::Done {
                    total_tokens: prompt_len + generated,
                    prompt_tokens: prompt_len,
                    completion_tokens: generated,
                })
                .await;

            info!(request_id = request.request_id, seq, generated, "Generation complete");
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generation_produces_tokens() {
        let config = Arc::new(Config::default());
        let mut engine = InferenceEngine::new(config);

        let request = GenerationRequest {
            request_id: "test-1".to_string(),
            prompt_tokens: vec![1, 2, 3],
            max_tokens: 5,
            temperature: 0.0,
            top_p: 1.0,
            stop_tokens: vec![],
        };

        let mut rx = engine.generate(request).await;

        let mut token_count = 0;
        let mut got_done = false;
        while let Some(event) = rx.recv().await {
            match event {
                GenerationEvent::Token { .. } => token_count += 1,
                GenerationEvent::Done { completion_tokens, .. } => {
                    assert_eq!(completion_tokens, 5);
                    got_done = true;
                }
                GenerationEvent::Error(e) => panic!("Unexpected error: {e}"),
            }
        }

        assert_eq!(token_count, 5);
        assert!(got_done);
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected() {
        let config = Arc::new(Config::default());
        let mut engine = InferenceEngine::new(config);

        let request = GenerationRequest {
            request_id: "test-empty".to_string(),
            prompt_tokens: vec![],
            max_tokens: 5,
            temperature: 0.0,
            top_p: 1.0,
            stop_tokens: vec![],
        };

        let mut rx = engine.generate(request).await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, GenerationEvent::Error(_)));
    }
}
