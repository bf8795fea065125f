/// Handle of an active observation created by [`crate::Cache::observe`].
///
/// The observer stays attached while the handle lives; dropping it detaches
/// the observer.
#[must_use = "dropping an Observation detaches the observer"]
pub struct Observation {
    id: usize,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Observation {
    pub(crate) fn new<F>(id: usize, detach: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            id,
            detach: Some(Box::new(detach)),
        }
    }

    /// Opaque identifier of the attached observer.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Observation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observation").field("id", &self.id).finish()
    }
}
