use anyhow::{Context, Result};
use log::{error, info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::core::cache::UnitCache;
use crate::core::config::Config;
use crate::core::io::Storage;
use crate::core::state::{
    Manifest, ManifestEntry, RunReport, Stage, StageOutcome, StageStatus, WorkUnit,
};
use crate::services::assembly::{Assembler, AssemblySummary};
use crate::services::captions::CaptionStage;
use crate::services::embedding::{create_embedding_client, EmbeddingClient};
use crate::services::llm::{create_llm, LlmClient};
use crate::services::memory::ContextMemory;
use crate::services::rewrite::RewriteStage;
use crate::services::synthesis::SynthesisStage;
use crate::services::transcribe::{create_transcriber, Transcriber};
use crate::services::tts::{create_tts_engine, TtsEngine};
use crate::services::voice::{VoiceMap, DEFAULT_VOICE};

/// What travels between stage workers.
#[derive(Debug, Clone)]
pub enum UnitMessage {
    Unit(ManifestEntry),
    EndOfStream,
}

/// Cooperative stop signal shared by all workers.
#[derive(Clone, Debug)]
pub struct StopHandle {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for StopHandle {
    fn default() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }
}

impl StopHandle {
    pub fn stop(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// External collaborators used by the stages.
pub struct Services {
    pub llm: Box<dyn LlmClient>,
    /// `None` disables the context memory.
    pub embedder: Option<Box<dyn EmbeddingClient>>,
    pub tts: Box<dyn TtsEngine>,
    /// `None` disables captions.
    pub transcriber: Option<Box<dyn Transcriber>>,
    pub voices: VoiceMap,
}

impl Services {
    pub fn from_config(config: &Config) -> Result<Self> {
        let llm = create_llm(&config.llm).context("Failed to create LLM client")?;
        let embedder = if config.memory.enabled {
            Some(
                create_embedding_client(&config.memory)
                    .context("Failed to create embedding client")?,
            )
        } else {
            None
        };
        let tts = create_tts_engine(&config.audio).context("Failed to create TTS engine")?;
        let transcriber = if config.captions.enabled {
            Some(create_transcriber(&config.captions).context("Failed to create transcriber")?)
        } else {
            None
        };
        let voices = VoiceMap::load(&config.audio.voices)?;
        Ok(Self {
            llm,
            embedder,
            tts,
            transcriber,
            voices,
        })
    }
}

#[derive(Debug)]
pub struct PipelineReport {
    pub run: RunReport,
    /// `None` when the run was stopped before assembly.
    pub assembly: Option<AssemblySummary>,
    pub stopped: bool,
}

/// Reads `.txt` units from the input folder.
///
/// With `chapters` configured, units follow that list and unlisted files
/// are ignored; otherwise they follow file name order.
pub async fn load_units(storage: &dyn Storage, config: &Config) -> Result<Vec<WorkUnit>> {
    let mut files: Vec<(String, String)> = Vec::new();
    for path in storage.list(&config.input_folder).await? {
        let p = Path::new(&path);
        if p.extension().and_then(|e| e.to_str()) != Some("txt") {
            continue;
        }
        if let Some(stem) = p.file_stem().and_then(|s| s.to_str()) {
            files.push((stem.to_string(), path.clone()));
        }
    }

    let ordered: Vec<(String, String)> = match &config.chapters {
        Some(order) => {
            let mut by_name: HashMap<String, String> = files.into_iter().collect();
            let mut ordered = Vec::with_capacity(order.len());
            for name in order {
                match by_name.remove(name) {
                    Some(path) => ordered.push((name.clone(), path)),
                    None => warn!("Chapter '{}' is listed but has no .txt file", name),
                }
            }
            let mut unlisted: Vec<&String> = by_name.keys().collect();
            unlisted.sort();
            for name in unlisted {
                warn!("Ignoring '{}': not in the chapters list", name);
            }
            ordered
        }
        None => files,
    };

    let mut units = Vec::with_capacity(ordered.len());
    for (index, (name, path)) in ordered.into_iter().enumerate() {
        let text = storage.read_to_string(&path).await?;
        units.push(WorkUnit::new(index, name, text));
    }
    info!("Loaded {} chapters from {}", units.len(), config.input_folder);
    Ok(units)
}

pub struct PipelineManager {
    config: Config,
    storage: Arc<dyn Storage>,
    services: Services,
    stop: StopHandle,
}

impl PipelineManager {
    pub fn new(config: Config, storage: Arc<dyn Storage>, services: Services) -> Self {
        Self {
            config,
            storage,
            services,
            stop: StopHandle::default(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub async fn run(self, units: Vec<WorkUnit>) -> Result<PipelineReport> {
        let Self {
            config,
            storage,
            services,
            stop,
        } = self;

        let cache = UnitCache::new(storage.clone(), &config.build_folder, config.cache.clone());
        let manifest_path = config.manifest_path();
        let manifest = Manifest::load(storage.as_ref(), &manifest_path).await?;

        let memory = match services.embedder {
            Some(embedder) if config.memory.enabled => {
                Some(ContextMemory::new(embedder, config.memory.clone()))
            }
            _ => None,
        };
        let speakers: Vec<String> = services
            .voices
            .names()
            .filter(|n| *n != DEFAULT_VOICE)
            .map(str::to_string)
            .collect();

        let rewrite = RewriteStage::new(
            services.llm,
            memory,
            cache.clone(),
            config.rewrite.clone(),
            config.llm.retry.clone(),
        )
        .with_speakers(speakers);
        let synthesis = SynthesisStage::new(
            services.tts,
            services.voices,
            cache.clone(),
            &config.audio,
        );
        let captions = CaptionStage::new(services.transcriber, cache.clone(), &config.captions);

        let (synthesis_tx, synthesis_rx) = mpsc::unbounded_channel();
        let (caption_tx, caption_rx) = mpsc::unbounded_channel();

        let units = Arc::new(units);
        let rewrite_handle = tokio::spawn(rewrite_worker(
            rewrite,
            units.clone(),
            RewriteOutput {
                cache: cache.clone(),
                storage: storage.clone(),
                manifest,
                manifest_path,
            },
            synthesis_tx,
            stop.clone(),
        ));
        let synthesis_handle = tokio::spawn(synthesis_worker(
            synthesis,
            synthesis_rx,
            caption_tx,
            stop.clone(),
        ));
        let caption_handle = tokio::spawn(caption_worker(captions, caption_rx, stop.clone()));

        let (rewritten, synthesized, captioned) =
            tokio::join!(rewrite_handle, synthesis_handle, caption_handle);
        let (rewrite_outcomes, manifest) = rewritten.context("Rewrite worker panicked")?;
        let synthesis_outcomes = synthesized.context("Synthesis worker panicked")?;
        let caption_outcomes = captioned.context("Caption worker panicked")?;

        let mut run = RunReport::new(&units);
        for outcome in rewrite_outcomes
            .into_iter()
            .chain(synthesis_outcomes)
            .chain(caption_outcomes)
        {
            run.record(outcome);
        }

        let stopped = stop.is_stopped();
        let assembly = if stopped {
            warn!("Stopped before assembly; rerun to resume");
            None
        } else {
            let assembler = Assembler::new(cache, &config.output_folder, &config.title);
            Some(assembler.assemble(&manifest).await?)
        };

        info!("Run finished: {}", run.summary());
        Ok(PipelineReport {
            run,
            assembly,
            stopped,
        })
    }
}

struct RewriteOutput {
    cache: UnitCache,
    storage: Arc<dyn Storage>,
    manifest: Manifest,
    manifest_path: String,
}

async fn rewrite_worker(
    mut stage: RewriteStage,
    units: Arc<Vec<WorkUnit>>,
    mut output: RewriteOutput,
    tx: mpsc::UnboundedSender<UnitMessage>,
    stop: StopHandle,
) -> (Vec<StageOutcome>, Manifest) {
    let mut outcomes = Vec::with_capacity(units.len());

    if output.manifest.retain_units(&units) {
        info!("Removed manifest entries for chapters no longer in the input");
        if let Err(e) = output
            .manifest
            .save(output.storage.as_ref(), &output.manifest_path)
            .await
        {
            error!("Failed to save manifest: {:#}", e);
        }
    }

    for (position, unit) in units.iter().enumerate() {
        if stop.is_stopped() {
            info!("Stop requested, no further chapters will be rewritten");
            break;
        }

        let status = stage.process(&units, position).await;
        if status.is_success() {
            let entry = ManifestEntry {
                index: unit.index,
                name: unit.name.clone(),
                file: output
                    .cache
                    .relative_path(unit.index, &unit.name, Stage::Rewrite),
            };
            if output.manifest.upsert(entry.clone()) {
                if let Err(e) = output
                    .manifest
                    .save(output.storage.as_ref(), &output.manifest_path)
                    .await
                {
                    error!("Failed to save manifest: {:#}", e);
                }
            }
            if tx.send(UnitMessage::Unit(entry)).is_err() {
                warn!("Synthesis worker is gone");
            }
        }
        outcomes.push(StageOutcome {
            index: unit.index,
            name: unit.name.clone(),
            stage: Stage::Rewrite,
            status,
        });
    }

    let _ = tx.send(UnitMessage::EndOfStream);
    (outcomes, output.manifest)
}

async fn synthesis_worker(
    mut stage: SynthesisStage,
    mut rx: mpsc::UnboundedReceiver<UnitMessage>,
    tx: mpsc::UnboundedSender<UnitMessage>,
    stop: StopHandle,
) -> Vec<StageOutcome> {
    let mut outcomes = Vec::new();
    let mut fatal = match stage.warm_up().await {
        Ok(()) => None,
        Err(e) => {
            error!("Synthesis unavailable for this run: {:#}", e);
            Some(format!("{:#}", e))
        }
    };

    while let Some(message) = rx.recv().await {
        let entry = match message {
            UnitMessage::Unit(entry) => entry,
            UnitMessage::EndOfStream => break,
        };

        let status = if let Some(reason) = &fatal {
            StageStatus::Failed(reason.clone())
        } else if stop.is_stopped() {
            StageStatus::NotReached
        } else {
            match stage.process(&entry).await {
                Ok(status) => status,
                Err(e) => {
                    error!("Synthesis worker stopping: {:#}", e);
                    let reason = format!("{:#}", e);
                    fatal = Some(reason.clone());
                    StageStatus::Failed(reason)
                }
            }
        };

        if status.is_success() && tx.send(UnitMessage::Unit(entry.clone())).is_err() {
            warn!("Caption worker is gone");
        }
        outcomes.push(StageOutcome {
            index: entry.index,
            name: entry.name,
            stage: Stage::Synthesis,
            status,
        });
    }

    let _ = tx.send(UnitMessage::EndOfStream);
    outcomes
}

async fn caption_worker(
    stage: CaptionStage,
    mut rx: mpsc::UnboundedReceiver<UnitMessage>,
    stop: StopHandle,
) -> Vec<StageOutcome> {
    let mut outcomes = Vec::new();

    while let Some(message) = rx.recv().await {
        let entry = match message {
            UnitMessage::Unit(entry) => entry,
            UnitMessage::EndOfStream => break,
        };
        let status = if stop.is_stopped() {
            StageStatus::NotReached
        } else {
            stage.process(&entry).await
        };
        outcomes.push(StageOutcome {
            index: entry.index,
            name: entry.name,
            stage: Stage::Caption,
            status,
        });
    }

    outcomes
}
