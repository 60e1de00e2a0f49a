//! Entry points tying resolution, assembly, launch and the training loop
//! together.

use crate::assembler::{PartAssembler, PartConstructor, Parts, load_states};
use crate::checkpoint::{CheckpointSaver, Snapshot};
use crate::config::{Config, ConfigResolver};
use crate::error::{TrainingError, TrainingResult};
use crate::job::{RunOptions, WorkerArgs};
use crate::launcher::{WorkerCommand, launch};
use crate::layout::ModelLayout;
use crate::optim::{OptimizerRegistry, Optimizers, assign, check_assignment};
use crate::precision::DynamicLossScaler;
use crate::progress::{ProgressLogger, TrainLogger};
use crate::registry::{CheckpointRef, ModelRegistry};
use crate::rendezvous::FileProcessGroup;
use crate::trainer::Trainer;
use crate::training_loop::{LoopSettings, LoopSummary, ResumePoint, TrainingLoop};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tessera_abstraction::{Collective, Device, MixedPrecision};
use tracing::{debug, info, info_span, warn};

/// Where configs, trained models and rendezvous files live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPaths {
    pub config_folder: PathBuf,
    pub model_folder: PathBuf,
    pub rendezvous_path: PathBuf,
}

/// What a trainer gets to know about the worker it runs in.
#[derive(Debug, Clone, Copy)]
pub struct TrainerContext<'a> {
    pub config: &'a Config,
    pub rank: usize,
    pub world_size: usize,
    pub device: Device,
    /// Seed for any randomness the trainer owns, such as data shuffling.
    pub seed: u64,
}

/// Supplies the model-specific collaborators of a run.
pub trait TrainerFactory: Send + Sync {
    type Trainer: Trainer;

    fn constructor(&self) -> &dyn PartConstructor;

    fn create(&self, context: &TrainerContext<'_>) -> TrainingResult<Self::Trainer>;

    /// Optimizers beyond the built-in Adam and SGD.
    fn optimizers(&self) -> OptimizerRegistry {
        OptimizerRegistry::new()
    }

    /// Collaborator used when a config asks for mixed precision.
    fn mixed_precision(&self) -> Option<Box<dyn MixedPrecision>> {
        Some(Box::new(DynamicLossScaler::default()))
    }
}

#[derive(Debug)]
pub struct Session<F> {
    factory: F,
    paths: SessionPaths,
}

impl<F: TrainerFactory> Session<F> {
    pub fn new(factory: F, paths: SessionPaths) -> Self {
        Self { factory, paths }
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn layout(&self) -> ModelLayout {
        ModelLayout::new(&self.paths.model_folder)
    }

    pub fn registry(&self) -> ModelRegistry {
        ModelRegistry::new(self.layout())
    }

    pub fn resolve(&self, name: &str, overrides: &[String]) -> TrainingResult<Config> {
        ConfigResolver::new(&self.paths.config_folder, self.layout()).resolve(name, overrides)
    }

    /// Builds the parts of a named config, with their pretrained weights.
    pub fn create_model(&self, name: &str, device: &Device, apply_jit: bool) -> TrainingResult<Parts> {
        let config = self.resolve(name, &[])?;
        PartAssembler::new(self.factory.constructor(), self.registry()).assemble(&config, device, apply_jit, true)
    }

    /// Rebuilds a trained model from `modelID[@tag]`.
    pub fn load_model(&self, checkpoint: &str, device: &Device) -> TrainingResult<Parts> {
        let reference = CheckpointRef::parse(checkpoint)?;
        let registry = self.registry();
        let config = registry.read_model_config(&reference.model_id)?;
        let mut parts =
            PartAssembler::new(self.factory.constructor(), registry.clone()).assemble(&config, device, false, false)?;
        load_states(&mut parts, &Snapshot::load(&registry.snapshot_path(&reference))?)?;
        info!(checkpoint = %reference, "model loaded");
        Ok(parts)
    }

    /// Resolves `name`, allocates a model ID and trains it on every device
    /// in `options`. Returns the model ID.
    pub async fn train(
        &self,
        name: &str,
        overrides: &[String],
        options: RunOptions,
        command: &WorkerCommand,
    ) -> TrainingResult<String> {
        let config = self.resolve(name, overrides)?;
        self.check(&config)?;

        let layout = self.layout();
        layout.ensure_root()?;
        let registry = self.registry();
        let model_id = registry.next_id()?;
        registry.clear_stale(&model_id)?;
        config.save(&layout.config_path(&model_id))?;
        info!(model = %model_id, config = name, devices = options.devices.len(), "starting training");

        let template = WorkerArgs {
            rank: 0,
            world_size: options.devices.len(),
            devices: options.devices.clone(),
            config,
            model_id: model_id.clone(),
            model_folder: self.paths.model_folder.clone(),
            rendezvous_path: self.paths.rendezvous_path.clone(),
            options,
        };
        launch(template, command, |args| self.run_worker(args).map(|_| ())).await?;
        Ok(model_id)
    }

    /// Everything about a resolved config that can fail without building a
    /// model. Runs before an ID is allocated or a worker is spawned.
    pub fn check(&self, config: &Config) -> TrainingResult<()> {
        let registry = self.registry();
        PartAssembler::new(self.factory.constructor(), registry.clone()).check(config)?;
        check_assignment(config, &self.factory.optimizers())?;
        LoopSettings::from_config(config, None)?;
        if let Some(reference) = config.load_checkpoint() {
            let path = registry.snapshot_path(&CheckpointRef::parse(&reference)?);
            if !path.is_file() {
                return Err(TrainingError::CheckpointNotFound(path));
            }
        }
        Ok(())
    }

    /// The body every worker runs, in the launching process or a spawned one.
    pub fn run_worker(&self, args: WorkerArgs) -> TrainingResult<LoopSummary> {
        let span = info_span!("worker", rank = args.rank);
        let _entered = span.enter();
        args.validate()?;

        let config = &args.config;
        let collective: Option<Box<dyn Collective>> = if args.world_size > 1 {
            let group = FileProcessGroup::join(
                &args.rendezvous_path,
                args.rank,
                args.world_size,
                config.rendezvous_timeout(),
            )?;
            Some(Box::new(group))
        } else {
            None
        };

        let seed = config.seed();
        let device = args.device();
        debug!(seed, %device, "worker starting");

        let layout = ModelLayout::new(&args.model_folder);
        let logger: Option<Box<dyn ProgressLogger>> = (args.rank == 0).then(|| {
            let mut logger = TrainLogger::new(layout.log_path(&args.model_id), config.epochs().unwrap_or_default());
            logger.set_min_wait(args.options.logger_min_wait(config));
            Box::new(logger) as Box<dyn ProgressLogger>
        });
        let saver = CheckpointSaver::for_rank(args.rank, layout.clone(), &args.model_id);

        let registry = ModelRegistry::new(layout);
        let mut parts =
            PartAssembler::new(self.factory.constructor(), registry.clone()).assemble(config, &device, true, true)?;
        let context = TrainerContext { config, rank: args.rank, world_size: args.world_size, device, seed };
        let mut trainer = self.factory.create(&context)?;
        let mut optimizers = assign(config, &parts, &self.factory.optimizers())?;
        let resume = match config.load_checkpoint() {
            Some(reference) => Some(restore(&registry, &reference, config, &mut parts, &mut optimizers)?),
            None => None,
        };

        let frozen = config.parts()?.into_iter().filter(|spec| spec.frozen).map(|spec| spec.name);
        let settings = LoopSettings::from_config(config, args.options.validate_every(config))?;
        let mixed_precision = settings.mixed_precision.as_ref().and_then(|_| self.factory.mixed_precision());

        let summary = TrainingLoop::new(&mut trainer, parts, optimizers, settings, device)
            .with_frozen(frozen)
            .with_logger(logger)
            .with_saver(saver)
            .with_mixed_precision(mixed_precision)
            .with_collective(collective)
            .resume_from(resume)
            .run()?;
        info!(batches = summary.batches_run, epochs = summary.epochs_completed, "worker finished");
        Ok(summary)
    }
}

/// Loads part and optimizer states from a checkpoint and returns where the
/// run continues.
fn restore(
    registry: &ModelRegistry,
    reference: &str,
    config: &Config,
    parts: &mut Parts,
    optimizers: &mut Optimizers,
) -> TrainingResult<ResumePoint> {
    let reference = CheckpointRef::parse(reference)?;
    let snapshot = Snapshot::load(&registry.snapshot_path(&reference))?;
    load_states(parts, &snapshot)?;

    if config.load_optimizers() {
        for (key, state) in &snapshot.optimizers {
            match optimizers.get_mut(key) {
                Some(optimizer) => optimizer.load_state(state)?,
                None => warn!(key = %key, checkpoint = %reference, "checkpoint optimizer has no counterpart, skipping"),
            }
        }
    }
    info!(checkpoint = %reference, epoch = snapshot.epoch, batch = snapshot.batch, "restored checkpoint");
    Ok(ResumePoint { epoch: snapshot.epoch, batch: snapshot.batch, mixed_precision: snapshot.mixed_precision })
}
