//! The `diag` payload: every component contributes one section.

use serde_json::{Map, Value};

/// Implemented by components that report into the periodic diagnostics
/// document. Implementations insert their own top-level section and keep
/// it small; the collected document still passes through the MTU
/// splitter on constrained transports.
pub trait Diagnosticable {
    fn collect_diagnostics(&self, obj: &mut Map<String, Value>);
}

/// Merge the sections of every registered component into `obj`.
pub fn collect_all(components: &[&dyn Diagnosticable], obj: &mut Map<String, Value>) {
    for component in components {
        component.collect_diagnostics(obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Section(&'static str, i64);

    impl Diagnosticable for Section {
        fn collect_diagnostics(&self, obj: &mut Map<String, Value>) {
            obj.insert(self.0.to_string(), json!(self.1));
        }
    }

    #[test]
    fn sections_merge_in_registration_order() {
        let mut obj = Map::new();
        collect_all(&[&Section("a", 1), &Section("b", 2)], &mut obj);
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["a"], json!(1));
        assert_eq!(obj["b"], json!(2));
    }
}
