//! Streaming orchestration over the provider: summaries, block
//! translations, batch title translation, cache clearing.
//!
//! Every stream hands the caller two channels: deltas, and an error channel
//! buffered to one. They are deliberately separate: a partial result must
//! still reach the client even when the stream dies halfway. Only a cleanly
//! closed stream persists its aggregate, as a single record keyed by
//! `(entry_id, readability, language)`.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rill_storage::{AiArtifactKind, CacheClearCounts, Store};
use rill_types::settings_keys;

use crate::limiter::RateLimiter;
use crate::provider::{ProviderConfig, stream_chat};
use crate::{AiError, DEFAULT_LANGUAGE, DEFAULT_RATE_LIMIT_RPM, MAX_BATCH_ITEMS, Result};

/// One translated fragment delta, tagged with the block it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslationDelta {
    pub index: usize,
    pub html: String,
}

/// A summarize stream: text deltas plus at most one error.
pub struct SummaryStream {
    pub deltas: mpsc::UnboundedReceiver<String>,
    pub errors: mpsc::Receiver<AiError>,
}

pub struct TranslationStream {
    pub deltas: mpsc::UnboundedReceiver<TranslationDelta>,
    pub errors: mpsc::Receiver<AiError>,
}

/// Input to batch translation.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub entry_id: i64,
    pub text: String,
}

/// Output of batch translation; cache hits arrive first with `cached=true`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchTranslation {
    pub entry_id: i64,
    pub text: String,
    pub cached: bool,
}

pub struct AiOrchestrator {
    store: Arc<Store>,
    limiter: Arc<RateLimiter>,
    config: ProviderConfig,
}

impl AiOrchestrator {
    /// Build the orchestrator, seeding the rate limiter from settings.
    #[must_use]
    pub fn new(store: Arc<Store>, config: ProviderConfig) -> Self {
        let rpm = store
            .get_setting(settings_keys::AI_RATE_LIMIT)
            .ok()
            .flatten()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT_RPM);
        Self {
            store,
            limiter: Arc::new(RateLimiter::new(rpm)),
            config,
        }
    }

    /// Change the provider rate limit; non-positive restores the default.
    pub fn set_rate_limit(&self, rpm: i64) {
        self.limiter.set_limit(rpm);
        if let Err(err) = self
            .store
            .set_setting(settings_keys::AI_RATE_LIMIT, &rpm.max(0).to_string())
        {
            tracing::warn!(error = %err, "failed to persist rate limit");
        }
    }

    fn language(&self) -> String {
        self.store
            .get_setting(settings_keys::AI_SUMMARY_LANGUAGE)
            .ok()
            .flatten()
            .filter(|language| !language.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string())
    }

    /// Stream a summary for an entry. A cache hit streams the stored text as
    /// one delta and closes.
    pub fn summarize(
        &self,
        entry_id: i64,
        readability: bool,
        cancel: &CancellationToken,
    ) -> Result<SummaryStream> {
        let language = self.language();
        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::channel(1);

        if let Some(cached) =
            self.store
                .get_ai_artifact(AiArtifactKind::Summary, entry_id, readability, &language)?
        {
            let _ = delta_tx.send(cached);
            return Ok(SummaryStream {
                deltas: delta_rx,
                errors: err_rx,
            });
        }

        let entry = self.store.get_entry(entry_id)?;
        let source = if readability {
            entry.readable_content.or(entry.content)
        } else {
            entry.content.or(entry.readable_content)
        }
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| AiError::Invalid("entry has no content to summarize".to_string()))?;

        let store = Arc::clone(&self.store);
        let limiter = Arc::clone(&self.limiter);
        let config = self.config.clone();
        let cancel = cancel.clone();
        let system = format!(
            "You summarize articles. Reply only with a concise summary written in {language}."
        );

        tokio::spawn(async move {
            if let Err(err) = limiter.wait(&cancel).await {
                let _ = err_tx.try_send(err);
                return;
            }

            let mut aggregate = String::new();
            let outcome = stream_chat(&config, &system, &source, &cancel, |delta| {
                aggregate.push_str(&delta);
                let _ = delta_tx.send(delta);
            })
            .await;

            match outcome {
                Ok(()) => {
                    if let Err(err) = store.put_ai_artifact(
                        AiArtifactKind::Summary,
                        entry_id,
                        readability,
                        &language,
                        &aggregate,
                    ) {
                        let _ = err_tx.try_send(err.into());
                    }
                }
                Err(err) => {
                    let _ = err_tx.try_send(err);
                }
            }
        });

        Ok(SummaryStream {
            deltas: delta_rx,
            errors: err_rx,
        })
    }

    /// Translate the blocks of an entry, streaming `{index, html}` deltas.
    /// The joined result persists only after every block finishes cleanly.
    pub fn translate_blocks(
        &self,
        entry_id: i64,
        readability: bool,
        blocks: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<TranslationStream> {
        if blocks.is_empty() {
            return Err(AiError::Invalid("no blocks to translate".to_string()));
        }

        let language = self.language();
        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::channel(1);

        if let Some(cached) = self.store.get_ai_artifact(
            AiArtifactKind::Translation,
            entry_id,
            readability,
            &language,
        )? {
            for (index, html) in cached.split('\n').enumerate() {
                let _ = delta_tx.send(TranslationDelta {
                    index,
                    html: html.to_string(),
                });
            }
            return Ok(TranslationStream {
                deltas: delta_rx,
                errors: err_rx,
            });
        }

        let store = Arc::clone(&self.store);
        let limiter = Arc::clone(&self.limiter);
        let config = self.config.clone();
        let cancel = cancel.clone();
        let system = format!(
            "You translate HTML fragments into {language}. Preserve every tag and attribute; \
             reply only with the translated fragment."
        );

        tokio::spawn(async move {
            let mut translated: Vec<String> = Vec::with_capacity(blocks.len());
            for (index, block) in blocks.iter().enumerate() {
                if let Err(err) = limiter.wait(&cancel).await {
                    let _ = err_tx.try_send(err);
                    return;
                }

                let mut aggregate = String::new();
                let outcome = stream_chat(&config, &system, block, &cancel, |delta| {
                    aggregate.push_str(&delta);
                    let _ = delta_tx.send(TranslationDelta {
                        index,
                        html: delta,
                    });
                })
                .await;

                if let Err(err) = outcome {
                    let _ = err_tx.try_send(err);
                    return;
                }
                translated.push(aggregate);
            }

            if let Err(err) = store.put_ai_artifact(
                AiArtifactKind::Translation,
                entry_id,
                readability,
                &language,
                &translated.join("\n"),
            ) {
                let _ = err_tx.try_send(err.into());
            }
        });

        Ok(TranslationStream {
            deltas: delta_rx,
            errors: err_rx,
        })
    }

    /// Translate up to 100 titles. Cached results are emitted before this
    /// returns; the rest stream as the provider answers.
    pub fn batch_translate(
        &self,
        items: Vec<BatchItem>,
        cancel: &CancellationToken,
    ) -> Result<(
        mpsc::UnboundedReceiver<BatchTranslation>,
        mpsc::Receiver<AiError>,
    )> {
        if items.len() > MAX_BATCH_ITEMS {
            return Err(AiError::Invalid(format!(
                "batch translate accepts at most {MAX_BATCH_ITEMS} items"
            )));
        }

        let language = self.language();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::channel(1);

        let mut misses = Vec::new();
        for item in items {
            match self.store.get_ai_artifact(
                AiArtifactKind::ListTranslation,
                item.entry_id,
                false,
                &language,
            )? {
                Some(text) => {
                    let _ = result_tx.send(BatchTranslation {
                        entry_id: item.entry_id,
                        text,
                        cached: true,
                    });
                }
                None => misses.push(item),
            }
        }

        let store = Arc::clone(&self.store);
        let limiter = Arc::clone(&self.limiter);
        let config = self.config.clone();
        let cancel = cancel.clone();
        let system = format!(
            "You translate feed entry titles into {language}. Reply only with the translation."
        );

        tokio::spawn(async move {
            for item in misses {
                if let Err(err) = limiter.wait(&cancel).await {
                    let _ = err_tx.try_send(err);
                    return;
                }

                let mut aggregate = String::new();
                let outcome = stream_chat(&config, &system, &item.text, &cancel, |delta| {
                    aggregate.push_str(&delta);
                })
                .await;

                match outcome {
                    Ok(()) => {
                        if let Err(err) = store.put_ai_artifact(
                            AiArtifactKind::ListTranslation,
                            item.entry_id,
                            false,
                            &language,
                            &aggregate,
                        ) {
                            let _ = err_tx.try_send(err.into());
                            return;
                        }
                        let _ = result_tx.send(BatchTranslation {
                            entry_id: item.entry_id,
                            text: aggregate,
                            cached: false,
                        });
                    }
                    Err(err) => {
                        let _ = err_tx.try_send(err);
                        return;
                    }
                }
            }
        });

        Ok((result_rx, err_rx))
    }

    /// Drop every cached artifact, reporting per-table counts.
    pub fn clear_cache(&self) -> Result<CacheClearCounts> {
        Ok(self.store.clear_ai_caches()?)
    }
}
