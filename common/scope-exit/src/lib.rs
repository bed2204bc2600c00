//! Scope guards.
//!
//! A scope guard runs a closure when it goes out of scope,
//! including when a panic unwinds through the scope.
//! The [`scope_exit!`] macro covers the unconditional case.
//! [`guard`] returns a guard that can be dismissed,
//! which is how partially constructed resources are released
//! on error paths but kept on success.

#![warn(missing_docs)]

use std::mem::ManuallyDrop;

/// Runs a closure when dropped, unless dismissed.
#[must_use = "the closure runs immediately if the guard is not bound"]
pub struct ScopeExit<F>
    where F: FnOnce()
{
    f: ManuallyDrop<F>,
    armed: bool,
}

impl<F> ScopeExit<F>
    where F: FnOnce()
{
    /// Create an armed guard.
    pub fn new(f: F) -> Self
    {
        Self{f: ManuallyDrop::new(f), armed: true}
    }

    /// Drop the guard without running the closure.
    pub fn dismiss(mut self)
    {
        self.armed = false;
    }
}

impl<F> Drop for ScopeExit<F>
    where F: FnOnce()
{
    fn drop(&mut self)
    {
        // SAFETY: self.f will not be used anymore.
        let f = unsafe { ManuallyDrop::take(&mut self.f) };
        if self.armed {
            f();
        }
    }
}

/// Create a guard that runs `f` on drop unless dismissed.
///
/// # Examples
///
/// ```
/// use std::cell::Cell;
/// let released = Cell::new(false);
/// {
///     let g = scope_exit::guard(|| released.set(true));
///     g.dismiss();
/// }
/// assert!(!released.get());
/// ```
pub fn guard<F>(f: F) -> ScopeExit<F>
    where F: FnOnce()
{
    ScopeExit::new(f)
}

/// Define an ad-hoc scope guard.
///
/// The code passed to this macro is performed at the end of the scope.
/// It is performed when the scope ends or when a panic passes through.
///
/// # Examples
///
/// ```
/// # use scope_exit::scope_exit;
/// use std::cell::Cell;
/// let x = Cell::new(0);
/// {
///     scope_exit! { x.set(1); }
///     x.set(2);
/// }
/// assert_eq!(x.get(), 1);
/// ```
#[macro_export]
macro_rules! scope_exit
{
    { $($tt:tt)* } => {
        let __scope_exit = $crate::ScopeExit::new(|| { $($tt)* });
    };
}
