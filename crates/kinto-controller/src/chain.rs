//! Interception chain construction.
//!
//! [`build_chain`] takes the links outermost first, attaches each one to
//! its successor, and returns the first as the entry point. The topology is
//! fixed once built: successor slots can only be set from this module, but
//! any decorator can read its own through [`successor`] or [`Link::next`].

use std::fmt;
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::debug;

use crate::api::ControllerApi;

/// Successor slot embedded in every forwarding decorator.
#[derive(Default)]
pub struct Link {
    next: OnceLock<Arc<dyn ControllerApi>>,
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_attached(&self) -> bool {
        self.next.get().is_some()
    }

    /// The link this one forwards to.
    ///
    /// # Panics
    ///
    /// When the link was never attached by [`build_chain`].
    pub fn next(&self) -> &Arc<dyn ControllerApi> {
        successor(Some(self))
    }

    pub(crate) fn attach(&self, next: Arc<dyn ControllerApi>) -> Result<(), ChainError> {
        self.next.set(next).map_err(|_| ChainError::AlreadyAttached)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// The next implementation in the chain.
///
/// # Panics
///
/// When called on the terminal link or on a link that was never attached.
/// Either means an operation forwarded past the end of the chain, which is
/// a wiring bug.
///
/// Decorators outside this crate forward with it the same way the stock
/// middlewares do: `successor(self.link()).get_environment(id).await`.
pub fn successor(link: Option<&Link>) -> &Arc<dyn ControllerApi> {
    match link.and_then(|l| l.next.get()) {
        Some(next) => next,
        None => panic!("controller call forwarded past the end of the chain"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("controller chain needs at least one link")]
    Empty,

    #[error("link {position} cannot forward: only the last link may be terminal")]
    NotForwarding { position: usize },

    #[error("last link forwards to nothing: the chain must end with a terminal implementation")]
    OpenEnded,

    #[error("link is already part of a chain")]
    AlreadyAttached,
}

/// Link `links` in order and return the entry point.
pub fn build_chain(
    links: Vec<Arc<dyn ControllerApi>>,
) -> Result<Arc<dyn ControllerApi>, ChainError> {
    let Some(last) = links.last() else {
        return Err(ChainError::Empty);
    };
    if last.link().is_some() {
        return Err(ChainError::OpenEnded);
    }
    for (position, link) in links[..links.len() - 1].iter().enumerate() {
        match link.link() {
            None => return Err(ChainError::NotForwarding { position }),
            Some(slot) if slot.is_attached() => return Err(ChainError::AlreadyAttached),
            Some(_) => {}
        }
    }

    for pair in links.windows(2) {
        if let Some(slot) = pair[0].link() {
            slot.attach(Arc::clone(&pair[1]))?;
        }
    }
    debug!(links = links.len(), "controller chain built");

    let mut links = links;
    Ok(links.swap_remove(0))
}
