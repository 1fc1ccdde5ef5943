use crate::collections::{FastHashSet, FastIndexMap};

/// Computes the 32-bit polynomial hash of a string.
///
/// The hash runs over the UTF-16 code units of the string (`h = 31 * h + unit`, wrapping), which makes it stable
/// across processes, platforms, and releases. Identifiers written to the backing file are derived from it, so readers
/// see the same identifier for the same name every time the process is restarted.
pub fn string_hash(name: &str) -> i32 {
    name.encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Calculates a unique, non-negative identifier for `name` within a namespace of already-used identifiers.
///
/// The identifier starts as the absolute value of [`string_hash`] (with `i32::MIN` nudged up by one so that negation
/// cannot overflow). While `is_used` reports the identifier as taken, it is incremented, wrapping from `i32::MAX` back
/// to zero.
///
/// The result depends only on `name` and the answers of `is_used`, so the same sequence of names always produces the
/// same sequence of identifiers.
pub fn calculate_id<F>(name: &str, is_used: F) -> u32
where
    F: Fn(u32) -> bool,
{
    let mut value = string_hash(name);
    if value == i32::MIN {
        value += 1;
    }
    let mut value = value.unsigned_abs();

    while is_used(value) {
        value = if value == i32::MAX as u32 { 0 } else { value + 1 };
    }

    value
}

fn next_free_id(name: &str, used_ids: &FastHashSet<u32>) -> u32 {
    calculate_id(name, |id| used_ids.contains(&id))
}

/// A handle to an instance domain within an [`InstanceDomains`] registry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DomainRef(usize);

impl DomainRef {
    /// Returns the position of the domain in registration order.
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A handle to an instance within an [`InstanceDomains`] registry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct InstanceRef {
    domain: DomainRef,
    index: usize,
}

impl InstanceRef {
    /// Returns the domain the instance belongs to.
    pub const fn domain(self) -> DomainRef {
        self.domain
    }

    /// Returns the position of the instance within its domain, in registration order.
    pub const fn index(self) -> usize {
        self.index
    }
}

/// One member of an instance domain.
#[derive(Debug)]
pub struct Instance {
    name: String,
    id: u32,
    offset: Option<usize>,
}

impl Instance {
    /// Returns the instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the instance identifier, unique within its domain.
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Returns the byte offset of the instance record, once laid out.
    pub const fn offset(&self) -> Option<usize> {
        self.offset
    }

    /// Sets the byte offset of the instance record.
    pub fn set_offset(&mut self, offset: usize) {
        self.offset = Some(offset);
    }
}

/// A named group of instances sharing one set of metrics.
#[derive(Debug)]
pub struct InstanceDomain {
    name: String,
    id: u32,
    instances: FastIndexMap<String, Instance>,
    used_ids: FastHashSet<u32>,
    offset: Option<usize>,
}

impl InstanceDomain {
    fn new(name: String, id: u32) -> Self {
        Self {
            name,
            id,
            instances: FastIndexMap::default(),
            used_ids: FastHashSet::default(),
            offset: None,
        }
    }

    /// Returns the domain name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the domain identifier, unique among domains.
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Returns the byte offset of the domain record, once laid out.
    pub const fn offset(&self) -> Option<usize> {
        self.offset
    }

    /// Sets the byte offset of the domain record.
    pub fn set_offset(&mut self, offset: usize) {
        self.offset = Some(offset);
    }

    /// Returns the number of instances in this domain.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns `true` if this domain has no instances.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Returns the instance with the given name, if it exists.
    pub fn get(&self, name: &str) -> Option<&Instance> {
        self.instances.get(name)
    }

    /// Returns an iterator over all instances, in the order they were created.
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    /// Returns a mutable iterator over all instances, in the order they were created.
    pub fn instances_mut(&mut self) -> impl Iterator<Item = &mut Instance> {
        self.instances.values_mut()
    }

    /// Gets the instance with the given name, creating it if it doesn't exist yet.
    ///
    /// Returns the position of the instance within this domain.
    pub fn get_or_create_instance(&mut self, name: &str) -> usize {
        if let Some(index) = self.instances.get_index_of(name) {
            return index;
        }

        let id = next_free_id(name, &self.used_ids);
        self.used_ids.insert(id);

        let (index, _) = self.instances.insert_full(
            name.to_string(),
            Instance {
                name: name.to_string(),
                id,
                offset: None,
            },
        );
        index
    }
}

/// Registry of instance domains, each created lazily on first reference.
///
/// Domains are never removed once created. Domain identifiers are unique among domains, and instance identifiers are
/// unique within their own domain.
#[derive(Debug, Default)]
pub struct InstanceDomains {
    domains: FastIndexMap<String, InstanceDomain>,
    used_ids: FastHashSet<u32>,
}

impl InstanceDomains {
    /// Gets the domain with the given name, creating it if it doesn't exist yet.
    pub fn get_or_create(&mut self, name: &str) -> DomainRef {
        if let Some(index) = self.domains.get_index_of(name) {
            return DomainRef(index);
        }

        let id = next_free_id(name, &self.used_ids);
        self.used_ids.insert(id);

        let (index, _) = self
            .domains
            .insert_full(name.to_string(), InstanceDomain::new(name.to_string(), id));
        DomainRef(index)
    }

    /// Gets the instance with the given name in the given domain, creating the domain and the instance as needed.
    pub fn get_or_create_instance(&mut self, domain: &str, instance: &str) -> InstanceRef {
        let domain = self.get_or_create(domain);
        let index = self.domains[domain.0].get_or_create_instance(instance);
        InstanceRef { domain, index }
    }

    /// Looks up a domain by name without creating it.
    pub fn find(&self, name: &str) -> Option<DomainRef> {
        self.domains.get_index_of(name).map(DomainRef)
    }

    /// Looks up an instance by domain and instance name without creating either.
    pub fn find_instance(&self, domain: &str, instance: &str) -> Option<InstanceRef> {
        let domain = self.find(domain)?;
        let index = self.domains[domain.0].instances.get_index_of(instance)?;
        Some(InstanceRef { domain, index })
    }

    /// Returns the domain behind the given handle.
    pub fn domain(&self, domain: DomainRef) -> &InstanceDomain {
        &self.domains[domain.0]
    }

    /// Returns the instance behind the given handle.
    pub fn instance(&self, instance: InstanceRef) -> &Instance {
        &self.domains[instance.domain.0].instances[instance.index]
    }

    /// Returns the number of domains.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Returns `true` if no domains have been created.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Returns the total number of instances across all domains.
    pub fn instance_count(&self) -> usize {
        self.domains.values().map(InstanceDomain::len).sum()
    }

    /// Returns an iterator over all domains, in the order they were created.
    pub fn iter(&self) -> impl Iterator<Item = (DomainRef, &InstanceDomain)> {
        self.domains.values().enumerate().map(|(i, d)| (DomainRef(i), d))
    }

    /// Returns a mutable iterator over all domains, in the order they were created.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (DomainRef, &mut InstanceDomain)> {
        self.domains.values_mut().enumerate().map(|(i, d)| (DomainRef(i), d))
    }
}

#[cfg(test)]
mod tests {
    use proptest::{collection::hash_set, prelude::*};

    use super::*;

    #[test]
    fn string_hash_is_polynomial() {
        assert_eq!(string_hash(""), 0);
        assert_eq!(string_hash("a"), 97);
        assert_eq!(string_hash("ab"), 97 * 31 + 98);
        // "Aa" and "BB" are the classic colliding pair for this hash.
        assert_eq!(string_hash("Aa"), string_hash("BB"));
    }

    #[test]
    fn colliding_names_are_probed() {
        let mut domains = InstanceDomains::default();
        let aa = domains.get_or_create("Aa");
        let bb = domains.get_or_create("BB");

        let aa_id = domains.domain(aa).id();
        let bb_id = domains.domain(bb).id();
        assert_eq!(aa_id, string_hash("Aa") as u32);
        assert_eq!(bb_id, aa_id + 1);
    }

    #[test]
    fn calculate_id_probes_linearly() {
        assert_eq!(calculate_id("", |_| false), 0);
        assert_eq!(calculate_id("", |id| id < 3), 3);
        assert_eq!(calculate_id("a", |id| id == 97 || id == 98), 99);
    }

    #[test]
    fn domains_are_referentially_stable() {
        let mut domains = InstanceDomains::default();
        let first = domains.get_or_create("aconex.controllers");
        let again = domains.get_or_create("aconex.controllers");
        let other = domains.get_or_create("aconex.tasks");

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(domains.len(), 2);

        let task_control = domains.get_or_create_instance("aconex.controllers", "TaskControl");
        let task_control_again = domains.get_or_create_instance("aconex.controllers", "TaskControl");
        let search = domains.get_or_create_instance("aconex.controllers", "SearchControlledDocControl");

        assert_eq!(task_control, task_control_again);
        assert_ne!(task_control, search);
        assert_eq!(task_control.domain(), first);
        assert_eq!(domains.domain(first).len(), 2);
        assert_eq!(domains.instance_count(), 2);
        assert_eq!(domains.find_instance("aconex.controllers", "TaskControl"), Some(task_control));
        assert_eq!(domains.find_instance("aconex.tasks", "TaskControl"), None);
    }

    #[test]
    fn instance_ids_are_scoped_to_their_domain() {
        let mut domains = InstanceDomains::default();
        let a = domains.get_or_create_instance("first", "same");
        let b = domains.get_or_create_instance("second", "same");

        // The same instance name in two domains gets the same id: the namespaces don't mix.
        assert_eq!(domains.instance(a).id(), domains.instance(b).id());
    }

    proptest! {
        #[test]
        fn property_test_ids_unique_and_deterministic(names in hash_set("[a-zA-Z0-9.]{0,12}", 1..64)) {
            let names: Vec<String> = names.into_iter().collect();

            let mut first = InstanceDomains::default();
            let mut second = InstanceDomains::default();
            let mut ids = FastHashSet::default();

            for name in &names {
                let a = first.get_or_create_instance("domain", name);
                let b = second.get_or_create_instance("domain", name);

                let id = first.instance(a).id();
                prop_assert_eq!(id, second.instance(b).id());
                prop_assert!(id <= i32::MAX as u32);
                prop_assert!(ids.insert(id));
            }

            let domain = first.find("domain").unwrap();
            prop_assert_eq!(first.domain(domain).len(), names.len());
        }
    }
}
