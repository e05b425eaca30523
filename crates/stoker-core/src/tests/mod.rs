//! Cross-module scenario tests with mock lifecycles.

mod lifecycle;

pub(crate) use mocks::MockLifecycle;
