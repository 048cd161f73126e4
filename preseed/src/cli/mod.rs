use anyhow::{Context, Result};
use clap::Args;
use common::{CustodianConfig, RestoreMethod};
use log::info;

use crate::{Orchestrator, PreseedOutcome, PreseedTarget};

/// Seed an empty service volume before the service starts
#[derive(Debug, Args)]
pub struct Preseed {
    /// Service whose volume to seed
    service: String,

    /// Restore methods to try, in order (defaults to the service's list)
    #[clap(long, value_delimiter = ',')]
    methods: Vec<RestoreMethod>,
}

impl Preseed {
    pub async fn run(self, config: &CustodianConfig) -> Result<()> {
        let disabled = config
            .services
            .get(&self.service)
            .and_then(|s| s.preseed.as_ref())
            .is_some_and(|p| !p.enable);
        if disabled {
            info!("Preseed is disabled for {}", self.service);
            return Ok(());
        }

        let mut target = PreseedTarget::from_config(config, &self.service)?;
        if !self.methods.is_empty() {
            target.methods = self.methods;
        }

        let orchestrator = Orchestrator::from_config(config, &target.methods);
        let outcome = orchestrator
            .run(&target)
            .await
            .with_context(|| format!("Could not seed the volume of {}", self.service))?;
        match outcome {
            PreseedOutcome::AlreadyPopulated => println!("{}: volume already populated", self.service),
            PreseedOutcome::Restored { method, attempts } => {
                for attempt in &attempts {
                    info!("{}: {}", attempt.method.as_str(), attempt.outcome);
                }
                println!("{}: restored with {}", self.service, method.as_str());
            }
        }
        Ok(())
    }
}
