//! Record processor contract
//!
//! A processor is invoked by a back-end while it holds the lock covering the
//! record. It sees the key and the current value (or `None` when the record
//! is absent) and answers with a [`Directive`].
//!
//! A processor must not call back into the DBM that invoked it: the
//! back-end lock is not re-entrant. Debug builds enforce this through
//! [`ProcessorGuard`].

use std::cell::RefCell;

/// What to do with the record after processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Leave the record as it is (or absent)
    Keep,
    /// Store these bytes as the new value
    Set(Vec<u8>),
    /// Delete the record
    Remove,
}

impl Directive {
    /// True for directives that modify the store
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Directive::Keep)
    }
}

/// Callback invoked under the record lock
pub trait RecordProcessor {
    /// Process one record; `value` is `None` if the key is absent
    fn process(&mut self, key: &[u8], value: Option<&[u8]>) -> Directive;

    /// Called once before and once after a full traversal by `process_each`.
    /// Closures use the default, so they see records only and get no
    /// boundary notifications; implement the trait to observe them.
    fn process_boundary(&mut self) {}
}

impl<F> RecordProcessor for F
where
    F: FnMut(&[u8], Option<&[u8]>) -> Directive,
{
    fn process(&mut self, key: &[u8], value: Option<&[u8]>) -> Directive {
        self(key, value)
    }
}

/// One entry of a multi-record operation
pub type ProcessOp<'a> = (&'a [u8], &'a mut dyn RecordProcessor);

thread_local! {
    static ACTIVE_OWNERS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks the current thread as running a processor on behalf of `owner`
pub(crate) struct ProcessorGuard {
    owner: usize,
}

impl ProcessorGuard {
    pub(crate) fn enter(owner: usize) -> Self {
        ACTIVE_OWNERS.with(|owners| owners.borrow_mut().push(owner));
        Self { owner }
    }
}

impl Drop for ProcessorGuard {
    fn drop(&mut self) {
        ACTIVE_OWNERS.with(|owners| {
            let mut owners = owners.borrow_mut();
            if let Some(pos) = owners.iter().rposition(|o| *o == self.owner) {
                owners.remove(pos);
            }
        });
    }
}

/// True while the current thread runs a processor for `owner`
pub(crate) fn is_inside(owner: usize) -> bool {
    ACTIVE_OWNERS.with(|owners| owners.borrow().contains(&owner))
}

/// Trip a debug assertion when a processor re-enters its own DBM
#[inline]
pub(crate) fn assert_not_reentrant(owner: usize) {
    debug_assert!(
        !is_inside(owner),
        "record processor re-entered the DBM that invoked it"
    );
}

/// Invoke a processor with the re-entrancy guard armed
#[inline]
pub(crate) fn invoke(
    owner: usize,
    proc: &mut dyn RecordProcessor,
    key: &[u8],
    value: Option<&[u8]>,
) -> Directive {
    let _guard = ProcessorGuard::enter(owner);
    proc.process(key, value)
}

#[inline]
pub(crate) fn invoke_boundary(owner: usize, proc: &mut dyn RecordProcessor) {
    let _guard = ProcessorGuard::enter(owner);
    proc.process_boundary();
}

/// Processor that copies the value out and keeps the record
#[derive(Debug, Default)]
pub struct GetProcessor {
    pub value: Option<Vec<u8>>,
}

impl RecordProcessor for GetProcessor {
    fn process(&mut self, _key: &[u8], value: Option<&[u8]>) -> Directive {
        self.value = value.map(<[u8]>::to_vec);
        Directive::Keep
    }
}
