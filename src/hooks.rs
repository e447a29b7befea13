use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::HookError,
    report::{ScenarioReport, StepReport},
    scenario::{Scenario, Step},
};

/// Identifies the step a hook is being invoked around.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub scenario: &'a str,
    pub index: usize,
    pub step: &'a Step,
}

/// Callbacks invoked by the runner at fixed lifecycle points. Every method
/// defaults to a no-op so hooks only implement the points they care about.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn before_scenario(&self, _scenario: &Scenario) -> Result<(), HookError> {
        Ok(())
    }

    async fn before_step(&self, _ctx: &StepContext<'_>) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_step(&self, _ctx: &StepContext<'_>, _report: &StepReport) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_scenario(
        &self,
        _scenario: &Scenario,
        _report: &ScenarioReport,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    BeforeScenario,
    BeforeStep,
    AfterStep,
    AfterScenario,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BeforeScenario => "before_scenario",
            Self::BeforeStep => "before_step",
            Self::AfterStep => "after_step",
            Self::AfterScenario => "after_scenario",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookFailure {
    pub hook: String,
    pub phase: HookPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    pub message: String,
    pub fatal: bool,
}

/// Result of invoking every hook for one lifecycle point.
#[derive(Debug, Default)]
pub struct HookInvocation {
    pub failures: Vec<HookFailure>,
}

impl HookInvocation {
    pub fn fatal(&self) -> Option<&HookFailure> {
        self.failures.iter().find(|failure| failure.fatal)
    }
}

struct RegisteredHook {
    name: String,
    hook: Arc<dyn Hook>,
    fatal: bool,
}

/// Ordered hook registry. Hooks run in registration order at every point.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<RegisteredHook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, hook: Arc<dyn Hook>) {
        self.push(name.into(), hook, false);
    }

    /// A failing fatal hook aborts the rest of the scenario it runs in.
    pub fn register_fatal(&mut self, name: impl Into<String>, hook: Arc<dyn Hook>) {
        self.push(name.into(), hook, true);
    }

    pub fn with_hook(mut self, name: impl Into<String>, hook: Arc<dyn Hook>) -> Self {
        self.register(name, hook);
        self
    }

    fn push(&mut self, name: String, hook: Arc<dyn Hook>, fatal: bool) {
        self.hooks.push(RegisteredHook { name, hook, fatal });
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn before_scenario(&self, scenario: &Scenario) -> HookInvocation {
        let mut invocation = HookInvocation::default();
        for entry in &self.hooks {
            let result = entry.hook.before_scenario(scenario).await;
            record(&mut invocation, entry, HookPhase::BeforeScenario, None, result);
            if invocation.fatal().is_some() {
                break;
            }
        }
        invocation
    }

    pub async fn before_step(&self, ctx: &StepContext<'_>) -> HookInvocation {
        let mut invocation = HookInvocation::default();
        for entry in &self.hooks {
            let result = entry.hook.before_step(ctx).await;
            record(&mut invocation, entry, HookPhase::BeforeStep, Some(ctx.index), result);
            if invocation.fatal().is_some() {
                break;
            }
        }
        invocation
    }

    /// Post-step hooks always all run, whatever the step verdict.
    pub async fn after_step(&self, ctx: &StepContext<'_>, report: &StepReport) -> HookInvocation {
        let mut invocation = HookInvocation::default();
        for entry in &self.hooks {
            let result = entry.hook.after_step(ctx, report).await;
            record(&mut invocation, entry, HookPhase::AfterStep, Some(ctx.index), result);
        }
        invocation
    }

    pub async fn after_scenario(&self, scenario: &Scenario, report: &ScenarioReport) -> HookInvocation {
        let mut invocation = HookInvocation::default();
        for entry in &self.hooks {
            let result = entry.hook.after_scenario(scenario, report).await;
            record(&mut invocation, entry, HookPhase::AfterScenario, None, result);
        }
        invocation
    }
}

fn record(
    invocation: &mut HookInvocation,
    entry: &RegisteredHook,
    phase: HookPhase,
    step: Option<usize>,
    result: Result<(), HookError>,
) {
    if let Err(err) = result {
        warn!(hook = %entry.name, %phase, fatal = entry.fatal, error = %err, "hook failed");
        invocation.failures.push(HookFailure {
            hook: entry.name.clone(),
            phase,
            step,
            message: err.message,
            fatal: entry.fatal,
        });
    }
}
