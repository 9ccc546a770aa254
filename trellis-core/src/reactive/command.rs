//! Command Implementation
//!
//! Commands are the write-only entry points of a store. A call binds the
//! command to its argument; dispatching the call runs the command function
//! with an untracked reader and applies whatever output it returns. Writes
//! made earlier in the same dispatch are visible to the function.

use std::sync::Arc;

use crate::domain::DomainRef;
use crate::error::Result;
use crate::graph::{NodeKind, Reader};
use crate::identity::{canonical_key, DeclId};

use super::output::{Call, Output};

type RunFn<A> = dyn Fn(&mut Reader<'_>, A) -> Result<Output> + Send + Sync;

/// Declaration of a command taking `A`.
///
/// # Example
///
/// ```rust,ignore
/// let count = StateDecl::new("Count", 0u32);
/// let add = {
///     let count = count.clone();
///     CommandDecl::new("Add", move |r, n: u32| Ok(count.set(r.get(&count)? + n)))
/// };
/// store.dispatch(add.call(3))?;
/// ```
pub struct CommandDecl<A = ()> {
    key: Arc<str>,
    owner: DomainRef,
    run: Arc<RunFn<A>>,
}

impl<A> Clone for CommandDecl<A> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            owner: self.owner.clone(),
            run: self.run.clone(),
        }
    }
}

impl<A> CommandDecl<A>
where
    A: Send + 'static,
{
    /// Declare a root-domain command.
    pub fn new<F>(name: impl Into<Arc<str>>, run: F) -> Self
    where
        F: Fn(&mut Reader<'_>, A) -> Result<Output> + Send + Sync + 'static,
    {
        Self::owned_by(DomainRef::root(), name.into(), Arc::new(run))
    }

    pub(crate) fn owned_by(owner: DomainRef, name: Arc<str>, run: Arc<RunFn<A>>) -> Self {
        Self {
            key: canonical_key(NodeKind::Command, DeclId::new(), &name, ""),
            owner,
            run,
        }
    }

    /// The canonical key of the command.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Bind the command to an argument.
    pub fn call(&self, arg: A) -> Output {
        let run = self.run.clone();
        Output::Command(Call {
            key: self.key.clone(),
            owner: self.owner.clone(),
            run: Box::new(move |reader: &mut Reader<'_>| run(reader, arg)),
        })
    }
}

impl<A> std::fmt::Debug for CommandDecl<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CommandDecl").field(&self.key).finish()
    }
}
