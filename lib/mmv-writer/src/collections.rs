/// [`BuildHasher`][std::hash::BuildHasher] used by every map in this crate.
///
/// Currently, [`foldhash`][foldhash] is used as the underlying implementation.
///
/// [foldhash]: http://github.com/orlp/foldhash
pub(crate) type FastBuildHasher = foldhash::quality::RandomState;

/// A hash map based on `hashbrown` ([`HashMap`][hashbrown::HashMap]) using [`FastBuildHasher`].
pub(crate) type FastHashMap<K, V> = hashbrown::HashMap<K, V, FastBuildHasher>;

/// A hash set based on `hashbrown` ([`HashSet`][hashbrown::HashSet]) using [`FastBuildHasher`].
pub(crate) type FastHashSet<T> = hashbrown::HashSet<T, FastBuildHasher>;

/// A hash map with stable insertion order based on `indexmap` ([`IndexMap`][indexmap::IndexMap]) using
/// [`FastBuildHasher`].
pub(crate) type FastIndexMap<K, V> = indexmap::IndexMap<K, V, FastBuildHasher>;
