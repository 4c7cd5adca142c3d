use fail::FailScenario;

/// Configures fail points for the lifetime of the value and switches them off on drop.
///
/// `fail` keeps its registry global, so tests using this must not run concurrently with other
/// tests touching the same fail points.
pub struct CustomFailScenario<'a> {
    _scenario: FailScenario<'a>,
    failpoints: Vec<String>,
}

impl<'a> CustomFailScenario<'a> {
    /// Applies every `(fail point, action)` pair, e.g. `(APPLY_BATCH, "2*return(connection)")`.
    ///
    /// # Panics
    ///
    /// Panics when an action cannot be parsed.
    pub fn setup(failpoints: &[(&str, &str)]) -> CustomFailScenario<'a> {
        let scenario = FailScenario::setup();

        for (failpoint, action) in failpoints {
            if let Err(err) = fail::cfg(*failpoint, action) {
                panic!("invalid action '{action}' for fail point '{failpoint}': {err}");
            }
        }

        Self {
            _scenario: scenario,
            failpoints: failpoints
                .iter()
                .map(|(failpoint, _)| failpoint.to_string())
                .collect(),
        }
    }
}

impl Drop for CustomFailScenario<'_> {
    fn drop(&mut self) {
        for failpoint in &self.failpoints {
            fail::remove(failpoint);
        }
    }
}
