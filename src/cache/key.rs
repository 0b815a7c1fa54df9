use std::fmt;

/// Identifier of a cached query, e.g. `["brands", "list"]`.
///
/// Keys are tuples rather than joined strings so two scopes can never
/// collide through their string forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
  scope: &'static str,
  kind: &'static str,
}

impl QueryKey {
  pub const fn new(scope: &'static str, kind: &'static str) -> Self {
    Self { scope, kind }
  }

  /// Key of the full-collection list query for `scope`.
  pub const fn list(scope: &'static str) -> Self {
    Self::new(scope, "list")
  }

  pub fn scope(&self) -> &'static str {
    self.scope
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{:?}, {:?}]", self.scope, self.kind)
  }
}
