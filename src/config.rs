//! Configuration resolver contract
//!
//! `when_fn` predicates may take parameters. Those are resolved, at
//! compile time, through a resolver registered on the [`crate::App`]:
//! a function from a type descriptor to a value. The resolver is the
//! only channel through which compilation consults external state; a
//! parameterized predicate with no resolver registered is a compile
//! error.

use std::sync::Arc;

use crate::key::TypeKey;
use crate::value::Value;

/// Resolves a typed predicate parameter to a value.
pub type ConfigResolver = Arc<dyn Fn(&TypeKey) -> anyhow::Result<Value> + Send + Sync>;

/// Build a resolver from a plain closure.
pub fn config_resolver(
    f: impl Fn(&TypeKey) -> anyhow::Result<Value> + Send + Sync + 'static,
) -> ConfigResolver {
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[derive(Clone, PartialEq, Debug)]
    struct Flags {
        verbose: bool,
    }

    #[test]
    fn resolver_returns_typed_value() {
        let resolver = config_resolver(|key| {
            if *key == TypeKey::of::<Flags>() {
                Ok(Value::new(Flags { verbose: true }))
            } else {
                Err(anyhow!("no config for {key}"))
            }
        });
        let value = resolver(&TypeKey::of::<Flags>()).unwrap();
        assert_eq!(value.extract::<Flags>(), Some(Flags { verbose: true }));
        assert!(resolver(&TypeKey::of::<u8>()).is_err());
    }
}
