#[cfg(feature = "serde")]
use serde::de::{Deserialize, SeqAccess, Visitor};
#[cfg(feature = "serde")]
use std::fmt;
#[cfg(feature = "serde")]
use std::iter;
#[cfg(feature = "serde")]
use std::marker::PhantomData;

use std::time::{Duration, Instant};

/// Turn a relative timeout into a deadline, saturating rather than
/// overflowing for absurdly large timeouts.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        // Roughly a century, plenty for "forever".
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365 * 100))
}

/// Deserializes a sequence straight into any collection built from its items.
#[cfg(feature = "serde")]
pub(crate) struct SetCollector<T, K>(PhantomData<(T, K)>);

#[cfg(feature = "serde")]
impl<T, K> Default for SetCollector<T, K> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[cfg(feature = "serde")]
impl<'de, T, K> Visitor<'de> for SetCollector<T, K>
where
    T: FromIterator<K>,
    K: Deserialize<'de>,
{
    type Value = T;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a sequence")
    }

    fn visit_seq<S>(self, mut access: S) -> Result<Self::Value, S::Error>
    where
        S: SeqAccess<'de>,
    {
        iter::from_fn(|| access.next_element().transpose()).collect()
    }
}
