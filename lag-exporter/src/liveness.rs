//! Deadline based liveness for the blocking consumer loop.
//!
//! Each loop registers under a name and must check in before its deadline runs
//! out. `/_liveness` answers 500 while any loop has not checked in yet or
//! missed its deadline. Check-ins are synchronous so the loop can report from a
//! blocking thread.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::warn;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, no check-in yet
    Starting,
    /// Live until the given instant
    HealthyUntil(OffsetDateTime),
    /// Missed its deadline
    Stalled,
}

#[derive(Default, Debug)]
pub struct LivenessStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for LivenessStatus {
    fn into_response(self) -> Response {
        let status = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, format!("{:?}", self.components)).into_response()
    }
}

type Deadlines = Arc<RwLock<HashMap<String, Option<OffsetDateTime>>>>;

pub struct LivenessHandle {
    component: String,
    deadline: Duration,
    deadlines: Deadlines,
}

impl LivenessHandle {
    /// Must be called more often than the deadline given at registration.
    pub fn report_healthy(&self) {
        let until = OffsetDateTime::now_utc() + self.deadline;
        match self.deadlines.write() {
            Ok(mut deadlines) => {
                _ = deadlines.insert(self.component.clone(), Some(until));
            }
            // Liveness checks keep failing and the process gets restarted
            Err(_) => warn!("poisoned liveness lock"),
        }
    }
}

#[derive(Clone, Default)]
pub struct LivenessRegistry {
    deadlines: Deadlines,
}

impl LivenessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, component: &str, deadline: Duration) -> LivenessHandle {
        match self.deadlines.write() {
            Ok(mut deadlines) => {
                _ = deadlines.insert(component.to_owned(), None);
            }
            Err(_) => warn!("poisoned liveness lock"),
        }
        LivenessHandle {
            component: component.to_owned(),
            deadline,
            deadlines: self.deadlines.clone(),
        }
    }

    /// Live when at least one component registered and none is starting or stalled.
    pub fn get_status(&self) -> LivenessStatus {
        let Ok(deadlines) = self.deadlines.read() else {
            warn!("poisoned liveness lock");
            return LivenessStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        let mut status = LivenessStatus {
            healthy: !deadlines.is_empty(),
            components: HashMap::with_capacity(deadlines.len()),
        };
        for (component, until) in deadlines.iter() {
            let component_status = match until {
                None => ComponentStatus::Starting,
                Some(until) if *until > now => ComponentStatus::HealthyUntil(*until),
                Some(_) => ComponentStatus::Stalled,
            };
            if !matches!(component_status, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(component.clone(), component_status);
        }

        if !status.healthy {
            warn!("liveness check failed: {:?}", status.components);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_not_live() {
        assert!(!LivenessRegistry::new().get_status().healthy);
    }

    #[test]
    fn live_after_check_in() {
        let registry = LivenessRegistry::new();
        let handle = registry.register("consumer", Duration::seconds(30));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("consumer"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn missed_deadline_is_stalled() {
        let registry = LivenessRegistry::new();
        let handle = registry.register("consumer", Duration::seconds(-1));

        handle.report_healthy();
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("consumer"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn every_component_must_check_in() {
        let registry = LivenessRegistry::new();
        let consumer = registry.register("consumer", Duration::seconds(30));
        let reporter = registry.register("reporter", Duration::seconds(30));

        consumer.report_healthy();
        assert!(!registry.get_status().healthy);

        reporter.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn response_status_follows_health() {
        let stalled = LivenessStatus::default().into_response();
        assert_eq!(stalled.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let live = LivenessStatus {
            healthy: true,
            components: HashMap::new(),
        }
        .into_response();
        assert_eq!(live.status(), StatusCode::OK);
    }
}
