//! Renders a [`FactStore`] as instructions for the next primary call.

use std::fmt::Write;

use tally_types::FactStore;

pub const SAVED_VALUES_HEADER: &str = "Saved values in memory:";
pub const LAST_RESULT_LABEL: &str = "Last calculated result:";

/// Instruction block describing the store, or an empty string when the store
/// holds nothing worth projecting.
#[must_use]
pub fn project(store: &FactStore) -> String {
    let mut output = String::new();

    if !store.saved_values().is_empty() {
        output.push_str(SAVED_VALUES_HEADER);
        output.push('\n');
        for (name, value) in store.saved_values() {
            let _ = writeln!(output, "{name} = {value}");
        }
    }

    if let Some(result) = store.last_result() {
        let _ = writeln!(output, "{LAST_RESULT_LABEL} {result}");
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tally_types::Decimal;

    #[test]
    fn empty_store_projects_nothing() {
        assert_eq!(project(&FactStore::new()), "");
    }

    #[test]
    fn saved_values_render_one_line_each() {
        let mut store = FactStore::new();
        store
            .insert_value("sleva", Decimal::from_str("21").unwrap())
            .unwrap();
        store
            .insert_value("dph", Decimal::from_str("0.21").unwrap())
            .unwrap();

        assert_eq!(
            project(&store),
            "Saved values in memory:\ndph = 0.21\nsleva = 21\n"
        );
    }

    #[test]
    fn last_result_only() {
        let mut store = FactStore::new();
        store.set_last_result(&Decimal::from_str("42.50").unwrap());
        assert_eq!(project(&store), "Last calculated result: 42.5\n");
    }

    #[test]
    fn last_expression_is_not_projected() {
        let mut store = FactStore::new();
        store.set_last_expression(Some("1 + 1".to_string()));
        assert_eq!(project(&store), "");
    }
}
