use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow, bail};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::http::{HttpSettings, RequestPacer, is_retryable_error, is_retryable_status};

pub const SOURCE_LANGUAGE: &str = "uk";
pub const TARGET_LANGUAGE: &str = "en";
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_CHUNK_SIZE: usize = 50;

/// Turns source-language strings into target-language strings, one output
/// per input, in order.
pub trait Translator: Send + Sync {
    fn translate_batch(&self, texts: &[String]) -> Result<Vec<String>>;
}

pub type TaskId = Uuid;

/// Called on a worker thread with `(task, translated, total)` after each chunk.
pub type ProgressCallback = Arc<dyn Fn(TaskId, usize, usize) + Send + Sync>;

type Completion = Box<dyn FnOnce(TaskId, Result<TranslationOutcome>) + Send>;

/// Result of a batch. A cancelled batch carries the chunks finished before
/// the cancellation was seen, so `texts` may be shorter than the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationOutcome {
    pub texts: Vec<String>,
    pub cancelled: bool,
}

struct Job {
    id: TaskId,
    texts: Vec<String>,
    progress: Option<ProgressCallback>,
    completion: Completion,
    cancel: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
pub struct TranslationHandle {
    id: TaskId,
    cancel: Arc<AtomicBool>,
}

impl TranslationHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Stop before the next chunk. Chunks already translated are kept.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

pub struct TranslationTask<T> {
    handle: TranslationHandle,
    receiver: Receiver<Result<T>>,
}

impl<T> TranslationTask<T> {
    pub fn id(&self) -> TaskId {
        self.handle.id()
    }

    pub fn handle(&self) -> TranslationHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn wait(self) -> Result<T> {
        self.receiver
            .recv()
            .map_err(|_| anyhow!("translation task {} was dropped by its worker", self.handle.id))?
    }
}

/// Fixed pool of worker threads translating queued batches chunk by chunk.
/// Dropping the queue lets workers finish queued jobs and joins them.
pub struct TranslationQueue {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl TranslationQueue {
    pub fn new(translator: Arc<dyn Translator>, workers: usize, chunk_size: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let chunk_size = chunk_size.max(1);
        let workers = (0..workers.max(1))
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                let translator = Arc::clone(&translator);
                thread::spawn(move || worker_loop(index, &receiver, translator.as_ref(), chunk_size))
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn queue_batch(
        &self,
        texts: Vec<String>,
        progress: Option<ProgressCallback>,
        completion: impl FnOnce(TaskId, Result<TranslationOutcome>) + Send + 'static,
    ) -> Result<TranslationHandle> {
        let handle = TranslationHandle {
            id: Uuid::new_v4(),
            cancel: Arc::new(AtomicBool::new(false)),
        };
        let Some(sender) = &self.sender else {
            bail!("translation queue is shut down");
        };
        debug!(task = %handle.id, items = texts.len(), "queueing translation batch");
        sender
            .send(Job {
                id: handle.id,
                texts,
                progress,
                completion: Box::new(completion),
                cancel: Arc::clone(&handle.cancel),
            })
            .map_err(|_| anyhow!("translation queue is shut down"))?;
        Ok(handle)
    }

    /// Queue a batch and run `continuation` on the worker once it finishes.
    /// A failed batch skips the continuation and surfaces the error through
    /// [`TranslationTask::wait`].
    pub fn queue_with_result<T, F>(
        &self,
        texts: Vec<String>,
        progress: Option<ProgressCallback>,
        continuation: F,
    ) -> Result<TranslationTask<T>>
    where
        T: Send + 'static,
        F: FnOnce(TranslationOutcome) -> Result<T> + Send + 'static,
    {
        let (result_sender, receiver) = mpsc::channel();
        let handle = self.queue_batch(texts, progress, move |id, outcome| {
            let result = outcome.and_then(continuation);
            if result_sender.send(result).is_err() {
                debug!(task = %id, "translation result dropped, nobody is waiting");
            }
        })?;
        Ok(TranslationTask { handle, receiver })
    }
}

impl Drop for TranslationQueue {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("translation worker panicked");
            }
        }
    }
}

fn worker_loop(index: usize, receiver: &Mutex<Receiver<Job>>, translator: &dyn Translator, chunk_size: usize) {
    loop {
        let job = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(job) = job else {
            debug!(worker = index, "translation worker stopping");
            return;
        };
        let Job {
            id,
            texts,
            progress,
            completion,
            cancel,
        } = job;
        let outcome = run_batch(id, &texts, translator, chunk_size, progress.as_ref(), &cancel);
        match &outcome {
            Ok(outcome) => info!(
                task = %id,
                translated = outcome.texts.len(),
                total = texts.len(),
                cancelled = outcome.cancelled,
                "translation batch finished"
            ),
            Err(error) => warn!(task = %id, error = %format!("{error:#}"), "translation batch failed"),
        }
        completion(id, outcome);
    }
}

fn run_batch(
    id: TaskId,
    texts: &[String],
    translator: &dyn Translator,
    chunk_size: usize,
    progress: Option<&ProgressCallback>,
    cancel: &AtomicBool,
) -> Result<TranslationOutcome> {
    let mut translated = Vec::with_capacity(texts.len());
    for chunk in texts.chunks(chunk_size) {
        if cancel.load(Ordering::SeqCst) {
            return Ok(TranslationOutcome {
                texts: translated,
                cancelled: true,
            });
        }
        let output = translator.translate_batch(chunk)?;
        if output.len() != chunk.len() {
            bail!(
                "translator returned {} strings for {} inputs",
                output.len(),
                chunk.len()
            );
        }
        translated.extend(output);
        if let Some(progress) = progress {
            progress(id, translated.len(), texts.len());
        }
    }
    Ok(TranslationOutcome {
        texts: translated,
        cancelled: false,
    })
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    q: &'a [String],
    source: &'a str,
    target: &'a str,
    format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Deserialize)]
struct TranslateResponse {
    #[serde(rename = "translatedText")]
    translated_text: Vec<String>,
}

pub struct HttpTranslator {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    max_retries: usize,
    pacer: RequestPacer,
}

impl HttpTranslator {
    pub fn new(endpoint: &str, api_key: Option<String>, settings: &HttpSettings) -> Result<Self> {
        Ok(Self {
            client: settings.build_client()?,
            endpoint: endpoint.trim().to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            max_retries: settings.max_retries,
            pacer: RequestPacer::new(settings),
        })
    }
}

impl Translator for HttpTranslator {
    fn translate_batch(&self, texts: &[String]) -> Result<Vec<String>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = TranslateRequest {
            q: texts,
            source: SOURCE_LANGUAGE,
            target: TARGET_LANGUAGE,
            format: "text",
            api_key: self.api_key.as_deref(),
        };
        for attempt in 0..=self.max_retries {
            self.pacer.pace();
            match self.client.post(&self.endpoint).json(&body).send() {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.max_retries && is_retryable_status(status) {
                            self.pacer.wait_before_retry(attempt, "translate");
                            continue;
                        }
                        bail!("translation request failed with HTTP {status}");
                    }
                    let payload: TranslateResponse = response
                        .json()
                        .context("failed to decode translation response")?;
                    return Ok(payload.translated_text);
                }
                Err(error) => {
                    if attempt < self.max_retries && is_retryable_error(&error) {
                        self.pacer.wait_before_retry(attempt, "translate");
                        continue;
                    }
                    return Err(error).context("failed to call translation endpoint");
                }
            }
        }
        bail!("translation request exhausted retry budget")
    }
}
