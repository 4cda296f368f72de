use crate::binding::Binding;
use crate::config::RouteConfig;
use crate::frame::RawExtension;

/// Passes Begin extensions through untouched. A route can require the extension to start with
///  a given prefix through a `prefix` condition, routes without conditions always match.
pub struct RawBinding;

impl Binding for RawBinding {
    type BeginEx = RawExtension;

    fn matches(&self, route: &RouteConfig, begin_ex: Option<&RawExtension>) -> bool {
        let octets = begin_ex.map(|ex| ex.0.as_ref()).unwrap_or(&[]);
        route.when.iter()
            .filter(|c| c.name == "prefix")
            .all(|c| octets.starts_with(c.value.as_bytes()))
    }
}


#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::*;
    use crate::config::RouteCondition;
    use super::*;

    #[rstest]
    #[case::unconditional(vec![], Some("anything"), true)]
    #[case::unconditional_without_extension(vec![], None, true)]
    #[case::prefix(vec![RouteCondition::new("prefix", "GET ")], Some("GET /index.html"), true)]
    #[case::prefix_mismatch(vec![RouteCondition::new("prefix", "GET ")], Some("POST /"), false)]
    #[case::prefix_without_extension(vec![RouteCondition::new("prefix", "GET ")], None, false)]
    #[case::other_condition(vec![RouteCondition::new("port", "80")], Some("x"), true)]
    fn test_matches(#[case] when: Vec<RouteCondition>, #[case] ext: Option<&'static str>, #[case] expected: bool) {
        let route = RouteConfig { exits: vec![2], guard: None, when };
        let ext = ext.map(|s| RawExtension(Bytes::from_static(s.as_bytes())));
        assert_eq!(RawBinding.matches(&route, ext.as_ref()), expected);
    }
}
