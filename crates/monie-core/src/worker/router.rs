//! Routing policy for intercepted requests.
//!
//! The policy is an ordered table of (predicate, strategy) pairs; the first
//! matching route wins. Deciding a route never awaits anything, so the worker
//! can commit to a strategy the moment a request is intercepted.

use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::http::Request;

/// How a request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Network first through the refresh service, stale cache on failure.
    Refresh,
    /// Straight to the network, never cached.
    Passthrough,
    /// Active generation first, then the configured miss policy.
    CacheFirst,
}

/// What to do when a cache-first request misses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMissPolicy {
    /// Answer with no response at all.
    NoResponse,
    /// Fetch from the network without storing.
    #[default]
    Network,
    /// Fetch from the network and keep successful GET responses.
    NetworkAndStore,
}

/// Paths the predicates compare against.
#[derive(Debug, Clone)]
pub struct RouteTargets {
    pub dynamic_path: String,
    pub push_register_path: String,
}

type Predicate = fn(&Request, &RouteTargets) -> bool;

#[derive(Clone)]
pub struct Route {
    pub name: &'static str,
    pub strategy: Strategy,
    matches: Predicate,
}

const REFRESH_RATES: Route = Route {
    name: "refresh-rates",
    strategy: Strategy::Refresh,
    matches: is_rates_refresh,
};

const PUSH_REGISTER: Route = Route {
    name: "push-register",
    strategy: Strategy::Passthrough,
    matches: is_push_registration,
};

const CACHE_FIRST: Route = Route {
    name: "cache-first",
    strategy: Strategy::CacheFirst,
    matches: any_request,
};

fn is_rates_refresh(request: &Request, targets: &RouteTargets) -> bool {
    request.path() == targets.dynamic_path && request.query_flag("refresh")
}

fn is_push_registration(request: &Request, targets: &RouteTargets) -> bool {
    request.method == Method::POST && request.path() == targets.push_register_path
}

fn any_request(_: &Request, _: &RouteTargets) -> bool {
    true
}

pub struct FetchRouter {
    targets: RouteTargets,
    routes: Vec<Route>,
    fallback: Route,
}

impl FetchRouter {
    pub fn new(targets: RouteTargets) -> Self {
        Self {
            targets,
            routes: vec![REFRESH_RATES, PUSH_REGISTER, CACHE_FIRST],
            fallback: CACHE_FIRST,
        }
    }

    /// First matching route for `request`.
    pub fn route(&self, request: &Request) -> &Route {
        self.routes
            .iter()
            .find(|route| (route.matches)(request, &self.targets))
            .unwrap_or(&self.fallback)
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}
