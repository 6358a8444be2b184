//! Link and path mutators
//!
//! Each [`Change`] turns into a single scheduled action on the resources named by the topology's
//! [`MutationTargets`]. Reroutes swap the dynamic routes of the second dumbbell between the
//! direct and rerouted sets of a [`ReroutePlan`], removing the previously installed routes by id.

use crate::config::traffic::{Change, ChangeKind};
use crate::topology::{MutationTargets, ReroutePlan};
use parking_lot::Mutex;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use testbed_network::clock::{Scheduler, SimTime};
use testbed_network::network::route::RouteId;
use testbed_network::network::{ErrorModelId, Network};

#[derive(Clone)]
pub struct LinkMutator {
    targets: Arc<MutationTargets>,
    error_model: ErrorModelId,
}

impl LinkMutator {
    /// Attaches the loss error model (initially lossless) to the targeted device
    pub fn install(network: &mut Network, targets: MutationTargets) -> anyhow::Result<Self> {
        let error_model = network.add_error_model(targets.error_model_device, 0.0)?;
        Ok(Self {
            targets: Arc::new(targets),
            error_model,
        })
    }

    pub fn error_model(&self) -> ErrorModelId {
        self.error_model
    }

    pub fn schedule(&self, scheduler: &mut Scheduler<Network>, change: &Change) {
        let mutator = self.clone();
        let Change { kind, value, .. } = *change;
        scheduler.schedule_at(SimTime::from_secs_f64(change.time), move |network, scheduler| {
            tracing::info!(at = %scheduler.now(), %kind, value, "applying link change");
            mutator.apply(network, kind, value)
        });
    }

    pub fn apply(&self, network: &mut Network, kind: ChangeKind, value: f64) -> anyhow::Result<()> {
        match kind {
            ChangeKind::Bandwidth => {
                let data_rate_bps = (value * 1e6).round() as u64;
                for &device in &self.targets.bottleneck {
                    network.set_data_rate(device, data_rate_bps)?;
                }
            }
            ChangeKind::Delay => {
                // The directive's delay is a round trip, each access link carries half of it
                let delay = Duration::from_secs_f64(value / 2.0 / 1000.0);
                for &link in &self.targets.access_links {
                    network.set_link_delay(link, delay)?;
                }
            }
            ChangeKind::Loss => network.set_error_rate(self.error_model, value)?,
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteMode {
    /// Each dumbbell uses its own bottleneck
    Direct,
    /// The second dumbbell's traffic goes through the cross links
    Rerouted,
}

impl Display for RouteMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteMode::Direct => write!(f, "direct"),
            RouteMode::Rerouted => write!(f, "rerouted"),
        }
    }
}

struct RerouteState {
    mode: RouteMode,
    /// Ids of the dynamic routes currently installed on each router
    installed: [Vec<RouteId>; 2],
}

#[derive(Clone)]
pub struct RerouteMutator {
    plan: Arc<ReroutePlan>,
    state: Arc<Mutex<RerouteState>>,
}

impl RerouteMutator {
    /// Installs the direct route set
    pub fn install(network: &mut Network, plan: ReroutePlan) -> anyhow::Result<Self> {
        let mutator = Self {
            plan: Arc::new(plan),
            state: Arc::new(Mutex::new(RerouteState {
                mode: RouteMode::Direct,
                installed: [Vec::new(), Vec::new()],
            })),
        };

        let mut state = mutator.state.lock();
        mutator.install_routes(network, RouteMode::Direct, &mut state)?;
        drop(state);

        Ok(mutator)
    }

    pub fn mode(&self) -> RouteMode {
        self.state.lock().mode
    }

    /// When the reroute and the reroute back happen, in simulated seconds
    pub fn times(&self) -> (f64, f64) {
        (self.plan.reroute_at, self.plan.reroute_back_at)
    }

    /// Schedules the reroute and the reroute back
    pub fn schedule(&self, scheduler: &mut Scheduler<Network>) {
        for (at, mode) in [
            (self.plan.reroute_at, RouteMode::Rerouted),
            (self.plan.reroute_back_at, RouteMode::Direct),
        ] {
            let mutator = self.clone();
            scheduler.schedule_at(SimTime::from_secs_f64(at), move |network, scheduler| {
                tracing::info!(at = %scheduler.now(), %mode, "switching routes");
                mutator.apply(network, mode)
            });
        }
    }

    /// Replaces the installed dynamic routes by the route set of `mode`
    pub fn apply(&self, network: &mut Network, mode: RouteMode) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        for (router, installed) in self.plan.routers.iter().zip(&mut state.installed) {
            for id in installed.drain(..) {
                network.remove_route(*router, id)?;
            }
        }

        self.install_routes(network, mode, &mut state)
    }

    fn install_routes(
        &self,
        network: &mut Network,
        mode: RouteMode,
        state: &mut RerouteState,
    ) -> anyhow::Result<()> {
        let routes = match mode {
            RouteMode::Direct => &self.plan.direct,
            RouteMode::Rerouted => &self.plan.rerouted,
        };

        let targets = self.plan.routers.iter().zip(routes);
        for ((router, routes), installed) in targets.zip(&mut state.installed) {
            for route in routes {
                installed.push(network.add_route(*router, route.clone())?);
            }
        }

        state.mode = mode;
        Ok(())
    }
}
