//! Regex routing of archive entry names

use mirror_core::MirrorError;
use regex::Regex;

use crate::error::ServiceResult;

/// A matched route with its capture groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<R> {
    /// The route that matched
    pub route: R,
    /// Capture groups 1.., empty strings for groups that did not participate
    pub captures: Vec<String>,
}

/// Ordered list of entry name patterns; the first match wins
#[derive(Debug, Clone)]
pub struct EntryRouter<R> {
    routes: Vec<(Regex, R)>,
}

impl<R> Default for EntryRouter<R> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<R: Copy> EntryRouter<R> {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route; patterns are anchored by the caller
    pub fn route(mut self, pattern: &str, route: R) -> ServiceResult<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            MirrorError::Internal(format!("Invalid entry pattern {}: {}", pattern, e))
        })?;
        self.routes.push((regex, route));
        Ok(self)
    }

    /// Find the first route matching `name`
    pub fn resolve(&self, name: &str) -> Option<RouteMatch<R>> {
        self.routes.iter().find_map(|(regex, route)| {
            regex.captures(name).map(|caps| RouteMatch {
                route: *route,
                captures: caps
                    .iter()
                    .skip(1)
                    .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect(),
            })
        })
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no route is registered
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Doc {
        Card,
        Release,
    }

    #[test]
    fn test_first_match_wins() {
        let router = EntryRouter::new()
            .route(r"^(\d+)\.json$", Doc::Card)
            .unwrap()
            .route(r"^releases/(.+)\.json$", Doc::Release)
            .unwrap();

        let card = router.resolve("12.json").unwrap();
        assert_eq!(card.route, Doc::Card);
        assert_eq!(card.captures, vec!["12".to_string()]);

        let release = router.resolve("releases/1.2.0-rc.1.json").unwrap();
        assert_eq!(release.route, Doc::Release);
        assert_eq!(release.captures, vec!["1.2.0-rc.1".to_string()]);

        assert!(router.resolve("notes.txt").is_none());
        assert!(router.resolve("nested/12.json").is_none());
    }

    #[test]
    fn test_invalid_pattern() {
        let err = EntryRouter::new().route("(", Doc::Card).unwrap_err();
        assert_eq!(err.kind(), mirror_core::ErrorKind::Internal);
    }
}
