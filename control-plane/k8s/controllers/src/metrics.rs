use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Reconcile outcomes, labelled by controller.
#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    reconciles: Family<ControllerLabels, Counter>,
    reconcile_errors: Family<ControllerLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ControllerLabels {
    controller: &'static str,
}

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Family::default();
        prom.register(
            "reconciles",
            "Count of reconcile passes",
            reconciles.clone(),
        );

        let reconcile_errors = Family::default();
        prom.register(
            "reconcile_errors",
            "Count of reconcile passes that failed",
            reconcile_errors.clone(),
        );

        Self {
            reconciles,
            reconcile_errors,
        }
    }

    pub fn record<T, E>(&self, controller: &'static str, result: &Result<T, E>) {
        let labels = ControllerLabels { controller };
        self.reconciles.get_or_create(&labels).inc();
        if result.is_err() {
            self.reconcile_errors.get_or_create(&labels).inc();
        }
    }
}
