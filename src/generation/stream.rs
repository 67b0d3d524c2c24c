//! Token loop that turns sampled tokens into UTF-8 safe text chunks.

use super::utf8::take_safe_prefix;
use crate::error::{Error, Result};
use crate::runtime::{Batch, InferenceRuntime, Token};

/// A runtime decode context plus the position bookkeeping the runtime does
/// not expose.
#[derive(Debug)]
pub struct DecodeContext<C> {
    handle: C,
    next_position: u32,
    window: u32,
}

impl<C> DecodeContext<C> {
    pub fn new(handle: C, window: u32) -> Self {
        Self {
            handle,
            next_position: 0,
            window,
        }
    }

    /// Tokens consumed so far.
    pub fn next_position(&self) -> u32 {
        self.next_position
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn is_empty(&self) -> bool {
        self.next_position == 0
    }

    pub fn handle(&self) -> &C {
        &self.handle
    }

    /// Decode `tokens` at the current position after checking they fit.
    pub fn prefill<R>(&mut self, runtime: &R, tokens: &[Token], logits_for_last: bool) -> Result<()>
    where
        R: InferenceRuntime<Context = C>,
    {
        if tokens.is_empty() {
            return Ok(());
        }
        let overflow = || Error::ContextOverflow {
            requested: tokens.len(),
            used: self.next_position,
            window: self.window,
        };
        let count = u32::try_from(tokens.len()).map_err(|_| overflow())?;
        let end = self.next_position.checked_add(count).ok_or_else(overflow)?;
        if end > self.window {
            return Err(overflow());
        }
        runtime.decode(
            &mut self.handle,
            &Batch {
                tokens,
                start_position: self.next_position,
                logits_for_last,
            },
        )?;
        self.next_position = end;
        Ok(())
    }
}

/// Why a generation run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    EndOfGeneration,
    MaxTokens,
    /// The callback asked to stop.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationOutcome {
    /// Non-EOG tokens produced.
    pub tokens: u32,
    pub finish: FinishReason,
}

/// Drives sample → feed → buffer → flush until a stop condition.
#[derive(Debug, Clone, Copy)]
pub struct StreamingGenerator {
    flush_every: usize,
}

impl StreamingGenerator {
    pub fn new(flush_every: u32) -> Self {
        Self {
            flush_every: (flush_every as usize).max(1),
        }
    }

    pub fn flush_every(&self) -> usize {
        self.flush_every
    }

    /// Generate into `callback` until end-of-generation, `max_tokens`, or the
    /// callback returning `false`.
    ///
    /// Chunks are non-empty and never split a UTF-8 sequence. Bytes still
    /// incomplete when generation ends are emitted with replacement
    /// characters.
    pub fn run<R, F>(
        &self,
        runtime: &R,
        model: &R::Model,
        context: &mut DecodeContext<R::Context>,
        sampler: &mut R::Sampler,
        max_tokens: u32,
        mut callback: F,
    ) -> Result<GenerationOutcome>
    where
        R: InferenceRuntime,
        F: FnMut(&str) -> bool,
    {
        let mut produced: u32 = 0;
        let mut pending: Vec<Token> = Vec::with_capacity(self.flush_every);
        let mut bytes: Vec<u8> = Vec::new();

        let finish = loop {
            let token = runtime.sample(sampler, &mut context.handle)?;
            context.prefill(runtime, &[token], true)?;

            if runtime.is_end_of_generation(model, token) {
                break FinishReason::EndOfGeneration;
            }

            pending.push(token);
            produced += 1;

            if pending.len() >= self.flush_every {
                bytes.extend(runtime.detokenize(model, &pending)?);
                pending.clear();
                let chunk = take_safe_prefix(&mut bytes);
                if !chunk.is_empty() && !callback(&chunk) {
                    tracing::debug!(tokens = produced, "Generation cancelled by callback");
                    return Ok(GenerationOutcome {
                        tokens: produced,
                        finish: FinishReason::Cancelled,
                    });
                }
            }

            if produced >= max_tokens {
                break FinishReason::MaxTokens;
            }
        };

        if !pending.is_empty() {
            bytes.extend(runtime.detokenize(model, &pending)?);
        }
        if !bytes.is_empty() {
            // Terminal flush; a `false` here has nothing left to cancel.
            let _ = callback(&String::from_utf8_lossy(&bytes));
        }

        Ok(GenerationOutcome {
            tokens: produced,
            finish,
        })
    }
}
