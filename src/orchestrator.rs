use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::backend::{call_with_retry, ImageBackend, RetryPolicy};
use crate::character::{ExpressionLabel, GenerationRequest, Mode};
use crate::cleanup::BackgroundCleaner;
use crate::error::GenerationError;
use crate::prompt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantStatus {
    Pending,
    Generated,
    Cleaned,
    Failed,
}

/// One expression slot's generation state. Owned by the orchestrator; each
/// fan-out task writes its slot exactly once, addressed by index.
#[derive(Debug)]
pub struct ExpressionVariant {
    pub index: usize,
    pub label: ExpressionLabel,
    pub prompt: String,
    pub raw_image: Option<Vec<u8>>,
    pub cleaned_image: Option<Vec<u8>>,
    /// False when the slot was produced by the fresh-generation fallback
    /// instead of an edit against the anchor.
    pub edit_derived: bool,
    pub status: VariantStatus,
    pub failure: Option<String>,
}

impl ExpressionVariant {
    fn pending(index: usize, label: ExpressionLabel, prompt: String) -> Self {
        Self {
            index,
            label,
            prompt,
            raw_image: None,
            cleaned_image: None,
            edit_derived: false,
            status: VariantStatus::Pending,
            failure: None,
        }
    }

    /// Cleaned image when cleanup ran, otherwise the raw generation.
    pub fn final_image(&self) -> Option<&[u8]> {
        self.cleaned_image
            .as_deref()
            .or(self.raw_image.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Complete,
    Partial,
}

/// Ordered outcome of one request. `variants.len()` always equals the
/// requested label count, in label order, regardless of completion order.
#[derive(Debug)]
pub struct GenerationResult {
    pub character_id: String,
    pub mode: Mode,
    pub variants: Vec<ExpressionVariant>,
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    /// Caps concurrent upstream calls during fan-out.
    pub worker_pool_size: usize,
    pub retry: RetryPolicy,
    /// Safety net: the batch always settles within this window.
    pub batch_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: 3,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(900),
            },
            batch_timeout: Duration::from_secs(600),
        }
    }
}

enum VariantOutcome {
    Produced { bytes: Vec<u8>, edit_derived: bool },
    Failed(String),
}

/// Two-phase engine: a synchronous anchor generation establishes the shared
/// visual reference, then the remaining expressions fan out onto a bounded
/// worker pool, each falling back from edit-conditioned generation to a
/// standalone call before giving up on its own slot.
pub struct GenerationOrchestrator {
    backend: Arc<dyn ImageBackend>,
    cleaner: Arc<BackgroundCleaner>,
    settings: OrchestratorSettings,
}

impl GenerationOrchestrator {
    pub fn new(
        backend: Arc<dyn ImageBackend>,
        cleaner: Arc<BackgroundCleaner>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            backend,
            cleaner,
            settings,
        }
    }

    pub async fn run(&self, request: GenerationRequest) -> Result<GenerationResult, GenerationError> {
        let character = Arc::new(request.character);
        let mode = request.mode;
        let seed = character.seed;
        let labels = request.labels;

        // Pre-sized slot buffer, fixed at submission time. Output order is
        // input label order whatever the completion interleaving.
        let mut slots: Vec<ExpressionVariant> = labels
            .iter()
            .enumerate()
            .map(|(index, label)| {
                ExpressionVariant::pending(
                    index,
                    *label,
                    prompt::standalone_prompt(&character, mode, index, label),
                )
            })
            .collect();

        info!(
            character_id = %character.character_id,
            mode = mode.name(),
            expressions = labels.len(),
            "starting generation batch"
        );

        // Anchor phase. Without an anchor no cross-variant consistency can be
        // promised, so exhausting its retry budget fails the whole request
        // before any fan-out task is spawned.
        let anchor_bytes = {
            let backend = self.backend.clone();
            let anchor_prompt = slots[0].prompt.clone();
            call_with_retry(&self.settings.retry, "anchor generation", move || {
                let backend = backend.clone();
                let prompt = anchor_prompt.clone();
                async move { backend.generate(&prompt, seed).await }
            })
            .await
            .map_err(GenerationError::AnchorFailed)?
        };
        slots[0].raw_image = Some(anchor_bytes.clone());
        slots[0].status = VariantStatus::Generated;
        info!(bytes = anchor_bytes.len(), "anchor image generated");

        let anchor = Arc::new(anchor_bytes);
        let semaphore = Arc::new(Semaphore::new(self.settings.worker_pool_size.max(1)));
        let retry = self.settings.retry;
        let mut tasks: JoinSet<(usize, VariantOutcome)> = JoinSet::new();

        for (index, label) in labels.iter().enumerate().skip(1) {
            let backend = self.backend.clone();
            let anchor = anchor.clone();
            let semaphore = semaphore.clone();
            let character = character.clone();
            let label = *label;
            let fallback_prompt = slots[index].prompt.clone();

            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, VariantOutcome::Failed("worker pool closed".into())),
                };

                let edit_prompt = prompt::edit_prompt(&character, mode, index, &label);
                let edit_result = {
                    let backend = backend.clone();
                    call_with_retry(
                        &retry,
                        &format!("edit call for '{}'", label.slug),
                        move || {
                            let backend = backend.clone();
                            let anchor = anchor.clone();
                            let prompt = edit_prompt.clone();
                            async move { backend.edit_from(&anchor, &prompt, seed).await }
                        },
                    )
                    .await
                };

                match edit_result {
                    Ok(bytes) => (
                        index,
                        VariantOutcome::Produced {
                            bytes,
                            edit_derived: true,
                        },
                    ),
                    Err(edit_err) => {
                        // Edit budget exhausted: fall back immediately to a
                        // standalone generation, trading pixel-identity for
                        // availability.
                        warn!(
                            slug = label.slug,
                            "edit failed, falling back to fresh generation: {}", edit_err
                        );
                        let fallback = call_with_retry(
                            &retry,
                            &format!("fallback generation for '{}'", label.slug),
                            move || {
                                let backend = backend.clone();
                                let prompt = fallback_prompt.clone();
                                async move { backend.generate(&prompt, seed).await }
                            },
                        )
                        .await;
                        match fallback {
                            Ok(bytes) => (
                                index,
                                VariantOutcome::Produced {
                                    bytes,
                                    edit_derived: false,
                                },
                            ),
                            Err(fallback_err) => (
                                index,
                                VariantOutcome::Failed(format!(
                                    "edit failed ({edit_err}); fallback failed ({fallback_err})"
                                )),
                            ),
                        }
                    }
                }
            });
        }

        let settle = tokio::time::timeout(self.settings.batch_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, outcome)) => apply_outcome(&mut slots[index], outcome),
                    Err(err) => warn!("variant task did not complete: {err}"),
                }
            }
        })
        .await;

        if settle.is_err() {
            warn!(
                timeout_secs = self.settings.batch_timeout.as_secs(),
                "batch timeout reached, aborting unfinished variants"
            );
            tasks.abort_all();
        }
        for slot in slots.iter_mut() {
            if slot.status == VariantStatus::Pending {
                slot.status = VariantStatus::Failed;
                slot.failure = Some("batch timeout".to_string());
            }
        }

        if mode.profile().removes_background {
            self.clean_batch(&mut slots);
        }

        let outcome = if slots.iter().any(|slot| slot.status == VariantStatus::Failed) {
            BatchOutcome::Partial
        } else {
            BatchOutcome::Complete
        };
        let failed = slots
            .iter()
            .filter(|slot| slot.status == VariantStatus::Failed)
            .count();
        let edit_derived = slots.iter().filter(|slot| slot.edit_derived).count();
        info!(
            character_id = %character.character_id,
            total = slots.len(),
            failed,
            edit_derived,
            "generation batch settled"
        );

        Ok(GenerationResult {
            character_id: character.character_id.clone(),
            mode,
            variants: slots,
            outcome,
        })
    }

    /// Cleanup failures degrade the slot to its raw image; they never fail
    /// the batch.
    fn clean_batch(&self, slots: &mut [ExpressionVariant]) {
        for slot in slots.iter_mut() {
            if slot.status != VariantStatus::Generated {
                continue;
            }
            let Some(raw) = slot.raw_image.as_deref() else {
                continue;
            };
            match self.cleaner.clean(raw) {
                Ok(cleaned) => {
                    slot.cleaned_image = Some(cleaned);
                    slot.status = VariantStatus::Cleaned;
                }
                Err(err) => {
                    warn!(slug = slot.label.slug, "background cleanup failed: {err}");
                }
            }
        }
    }
}

fn apply_outcome(slot: &mut ExpressionVariant, outcome: VariantOutcome) {
    match outcome {
        VariantOutcome::Produced {
            bytes,
            edit_derived,
        } => {
            slot.raw_image = Some(bytes);
            slot.edit_derived = edit_derived;
            slot.status = VariantStatus::Generated;
        }
        VariantOutcome::Failed(message) => {
            slot.status = VariantStatus::Failed;
            slot.failure = Some(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use image::{ImageFormat, Rgba, RgbaImage};

    use crate::character::CharacterSpec;
    use crate::error::BackendError;

    fn sample_spec() -> CharacterSpec {
        serde_json::from_value(serde_json::json!({
            "character_id": "char_007",
            "seed": 99,
            "age": "16歳",
            "body_type": "細身",
            "eyes": "大きい茶色の目",
            "hair": "黒のロングストレート",
            "outfit": "制服"
        }))
        .expect("spec should deserialize")
    }

    fn green_backdrop_png() -> Vec<u8> {
        let mut img = RgbaImage::from_pixel(8, 8, Rgba([0, 255, 0, 255]));
        for y in 2..6 {
            for x in 2..6 {
                img.put_pixel(x, y, Rgba([200, 60, 60, 255]));
            }
        }
        let mut buffer = Cursor::new(Vec::new());
        img.write_to(&mut buffer, ImageFormat::Png).expect("png encode");
        buffer.into_inner()
    }

    /// Extracts the 1-based slot number from the rendered prompt ("#3: ...").
    fn slot_number(prompt: &str) -> usize {
        prompt
            .lines()
            .find_map(|line| {
                let rest = line.strip_prefix('#')?;
                let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().ok()
            })
            .expect("prompt should carry a slot number")
    }

    /// Scripted backend: per-slot transient failure budgets for edit and
    /// generate calls, optional per-slot completion delay, call recording.
    struct ScriptedBackend {
        edit_failures: HashMap<usize, usize>,
        generate_failures: HashMap<usize, usize>,
        permanent_generate: bool,
        reverse_delays: bool,
        edit_attempts: Mutex<HashMap<usize, usize>>,
        generate_attempts: Mutex<HashMap<usize, usize>>,
        edit_calls: AtomicUsize,
        generate_calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new() -> Self {
            Self {
                edit_failures: HashMap::new(),
                generate_failures: HashMap::new(),
                permanent_generate: false,
                reverse_delays: false,
                edit_attempts: Mutex::new(HashMap::new()),
                generate_attempts: Mutex::new(HashMap::new()),
                edit_calls: AtomicUsize::new(0),
                generate_calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        async fn track_concurrency(&self) {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ImageBackend for ScriptedBackend {
        async fn generate(&self, prompt: &str, _seed: i64) -> Result<Vec<u8>, BackendError> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            if self.permanent_generate {
                return Err(BackendError::permanent("API key not valid"));
            }
            let slot = slot_number(prompt);
            let budget = self.generate_failures.get(&slot).copied().unwrap_or(0);
            {
                let mut attempts = self.generate_attempts.lock().expect("lock");
                let seen = attempts.entry(slot).or_insert(0);
                *seen += 1;
                if *seen <= budget {
                    return Err(BackendError::transient("upstream timeout"));
                }
            }
            self.track_concurrency().await;
            Ok(green_backdrop_png())
        }

        async fn edit_from(
            &self,
            _base: &[u8],
            prompt: &str,
            _seed: i64,
        ) -> Result<Vec<u8>, BackendError> {
            self.edit_calls.fetch_add(1, Ordering::SeqCst);
            let slot = slot_number(prompt);
            let budget = self.edit_failures.get(&slot).copied().unwrap_or(0);
            {
                let mut attempts = self.edit_attempts.lock().expect("lock");
                let seen = attempts.entry(slot).or_insert(0);
                *seen += 1;
                if *seen <= budget {
                    return Err(BackendError::transient("edit rejected upstream"));
                }
            }
            if self.reverse_delays {
                // Later slots finish first to exercise the ordering invariant.
                let delay = 40u64.saturating_sub(slot as u64 * 10);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.track_concurrency().await;
            Ok(green_backdrop_png())
        }
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            worker_pool_size: 2,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(0),
            },
            batch_timeout: Duration::from_secs(30),
        }
    }

    fn orchestrator(backend: Arc<ScriptedBackend>) -> GenerationOrchestrator {
        GenerationOrchestrator::new(backend, Arc::new(BackgroundCleaner::default()), settings())
    }

    fn normal_request() -> GenerationRequest {
        GenerationRequest::new(sample_spec(), Mode::Normal).expect("valid request")
    }

    #[tokio::test]
    async fn all_variants_succeed_in_label_order() {
        let backend = Arc::new(ScriptedBackend::new());
        let result = orchestrator(backend.clone())
            .run(normal_request())
            .await
            .expect("batch should succeed");

        assert_eq!(result.outcome, BatchOutcome::Complete);
        assert_eq!(result.variants.len(), 4);
        let slugs: Vec<&str> = result.variants.iter().map(|v| v.label.slug).collect();
        assert_eq!(slugs, vec!["neutral", "smile", "surprised", "troubled"]);

        // Normal mode runs cleanup over every produced slot.
        for variant in &result.variants {
            assert_eq!(variant.status, VariantStatus::Cleaned);
            assert!(variant.final_image().is_some());
        }
        assert!(!result.variants[0].edit_derived, "anchor is never an edit");
        assert!(result.variants[1..].iter().all(|v| v.edit_derived));
        assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.edit_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn anchor_permanent_failure_attempts_no_variants() {
        let mut backend = ScriptedBackend::new();
        backend.permanent_generate = true;
        let backend = Arc::new(backend);

        let err = orchestrator(backend.clone())
            .run(normal_request())
            .await
            .expect_err("anchor failure is fatal");
        assert!(matches!(err, GenerationError::AnchorFailed(_)));
        assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.edit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn anchor_transient_failure_uses_retry_budget_then_fails() {
        let mut backend = ScriptedBackend::new();
        // Slot 1 is the anchor; more failures than the budget of 2 attempts.
        backend.generate_failures.insert(1, 5);
        let backend = Arc::new(backend);

        let err = orchestrator(backend.clone())
            .run(normal_request())
            .await
            .expect_err("anchor failure is fatal");
        assert!(matches!(err, GenerationError::AnchorFailed(_)));
        assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 2);
        assert_eq!(backend.edit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_edit_falls_back_to_fresh_generation() {
        let mut backend = ScriptedBackend::new();
        // "surprised" is slot 3; its edit times out past the retry budget,
        // the fallback generate succeeds.
        backend.edit_failures.insert(3, 5);
        let backend = Arc::new(backend);

        let result = orchestrator(backend.clone())
            .run(normal_request())
            .await
            .expect("batch should succeed");

        let surprised = &result.variants[2];
        assert_eq!(surprised.label.slug, "surprised");
        assert_eq!(surprised.index, 2);
        assert_ne!(surprised.status, VariantStatus::Failed);
        assert!(!surprised.edit_derived, "slot came from the fallback path");
        assert_eq!(result.outcome, BatchOutcome::Complete);
        // Anchor + one fallback generation.
        assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn variant_failure_is_local_to_its_slot() {
        let mut backend = ScriptedBackend::new();
        backend.edit_failures.insert(2, 5);
        backend.generate_failures.insert(2, 5);
        let backend = Arc::new(backend);

        let result = orchestrator(backend)
            .run(normal_request())
            .await
            .expect("partial batches still return a result");

        assert_eq!(result.outcome, BatchOutcome::Partial);
        assert_eq!(result.variants.len(), 4);
        let smile = &result.variants[1];
        assert_eq!(smile.label.slug, "smile");
        assert_eq!(smile.status, VariantStatus::Failed);
        assert!(smile.failure.as_deref().unwrap_or("").contains("fallback failed"));
        for variant in [&result.variants[0], &result.variants[2], &result.variants[3]] {
            assert_eq!(variant.status, VariantStatus::Cleaned);
        }
    }

    #[tokio::test]
    async fn output_order_is_independent_of_completion_order() {
        let mut backend = ScriptedBackend::new();
        backend.reverse_delays = true;
        let backend = Arc::new(backend);

        let mut settings = settings();
        settings.worker_pool_size = 8;
        let orchestrator = GenerationOrchestrator::new(
            backend,
            Arc::new(BackgroundCleaner::default()),
            settings,
        );
        let result = orchestrator
            .run(GenerationRequest::new(sample_spec(), Mode::Fantasy).expect("valid request"))
            .await
            .expect("batch should succeed");

        assert_eq!(result.variants.len(), 8);
        for (position, variant) in result.variants.iter().enumerate() {
            assert_eq!(variant.index, position);
            assert_eq!(variant.label.slug, Mode::Fantasy.expressions()[position].slug);
        }
    }

    #[tokio::test]
    async fn fan_out_respects_worker_pool_bound() {
        let backend = Arc::new(ScriptedBackend::new());
        let result = orchestrator(backend.clone())
            .run(GenerationRequest::new(sample_spec(), Mode::Emo).expect("valid request"))
            .await
            .expect("batch should succeed");

        assert_eq!(result.variants.len(), 6);
        assert!(
            backend.max_in_flight.load(Ordering::SeqCst) <= 2,
            "pool of 2 must cap concurrent upstream calls"
        );
    }

    #[tokio::test]
    async fn dark_modes_skip_background_cleanup() {
        let backend = Arc::new(ScriptedBackend::new());
        let result = orchestrator(backend)
            .run(GenerationRequest::new(sample_spec(), Mode::Emo).expect("valid request"))
            .await
            .expect("batch should succeed");

        for variant in &result.variants {
            assert_eq!(variant.status, VariantStatus::Generated);
            assert!(variant.cleaned_image.is_none());
        }
    }

    #[tokio::test]
    async fn cleanup_failure_degrades_to_raw_image() {
        /// Returns bytes that are not a decodable image.
        struct GarbageBackend;

        #[async_trait]
        impl ImageBackend for GarbageBackend {
            async fn generate(&self, _prompt: &str, _seed: i64) -> Result<Vec<u8>, BackendError> {
                Ok(b"not an image".to_vec())
            }
            async fn edit_from(
                &self,
                _base: &[u8],
                _prompt: &str,
                _seed: i64,
            ) -> Result<Vec<u8>, BackendError> {
                Ok(b"not an image".to_vec())
            }
        }

        let orchestrator = GenerationOrchestrator::new(
            Arc::new(GarbageBackend),
            Arc::new(BackgroundCleaner::default()),
            settings(),
        );
        let result = orchestrator
            .run(normal_request())
            .await
            .expect("cleanup failure never fails the batch");

        assert_eq!(result.outcome, BatchOutcome::Complete);
        for variant in &result.variants {
            assert_eq!(variant.status, VariantStatus::Generated);
            assert!(variant.cleaned_image.is_none());
            assert_eq!(variant.final_image(), Some(b"not an image".as_slice()));
        }
    }

    #[tokio::test]
    async fn settled_batch_assembles_into_labelled_archive() {
        let backend = Arc::new(ScriptedBackend::new());
        let result = orchestrator(backend)
            .run(normal_request())
            .await
            .expect("batch should succeed");

        let bytes = crate::assemble::build_archive(&result).expect("archive");
        let mut archive =
            zip::ZipArchive::new(Cursor::new(bytes)).expect("readable archive");
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).expect("entry").name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "char_007_expr01_neutral.png",
                "char_007_expr02_smile.png",
                "char_007_expr03_surprised.png",
                "char_007_expr04_troubled.png",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn batch_timeout_settles_unfinished_slots_as_failed() {
        /// Anchor responds, every edit and fallback hangs far past the batch
        /// timeout.
        struct StallingBackend;

        #[async_trait]
        impl ImageBackend for StallingBackend {
            async fn generate(&self, prompt: &str, _seed: i64) -> Result<Vec<u8>, BackendError> {
                if slot_number(prompt) == 1 {
                    return Ok(green_backdrop_png());
                }
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(green_backdrop_png())
            }
            async fn edit_from(
                &self,
                _base: &[u8],
                _prompt: &str,
                _seed: i64,
            ) -> Result<Vec<u8>, BackendError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(green_backdrop_png())
            }
        }

        let mut settings = settings();
        settings.batch_timeout = Duration::from_secs(5);
        let orchestrator = GenerationOrchestrator::new(
            Arc::new(StallingBackend),
            Arc::new(BackgroundCleaner::default()),
            settings,
        );
        let result = orchestrator
            .run(normal_request())
            .await
            .expect("timeout still yields an ordered result");

        assert_eq!(result.outcome, BatchOutcome::Partial);
        assert_eq!(result.variants.len(), 4);
        assert_ne!(result.variants[0].status, VariantStatus::Failed);
        for variant in &result.variants[1..] {
            assert_eq!(variant.status, VariantStatus::Failed);
            assert_eq!(variant.failure.as_deref(), Some("batch timeout"));
        }
    }
}
