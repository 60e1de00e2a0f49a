//! Reference model shipped with the CLI: `linear` parts trained by the
//! `regression` trainer.

pub mod linear;
pub mod regression;

use linear::Linear;
use regression::RegressionTrainer;
use tessera_abstraction::Part;
use tessera_training::{ArchitectureRegistry, PartConstructor, TrainerContext, TrainerFactory, TrainingResult};

#[derive(Debug)]
pub struct ReferenceFactory {
    architectures: ArchitectureRegistry,
}

impl ReferenceFactory {
    pub fn new() -> Self {
        let mut architectures = ArchitectureRegistry::new();
        architectures.register(linear::ARCHITECTURE, |spec, config| {
            Ok(Box::new(Linear::from_spec(spec, config)?) as Box<dyn Part>)
        });
        Self { architectures }
    }
}

impl Default for ReferenceFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainerFactory for ReferenceFactory {
    type Trainer = RegressionTrainer;

    fn constructor(&self) -> &dyn PartConstructor {
        &self.architectures
    }

    fn create(&self, context: &TrainerContext<'_>) -> TrainingResult<RegressionTrainer> {
        RegressionTrainer::new(context)
    }
}
