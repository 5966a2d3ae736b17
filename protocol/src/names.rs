//! Human-readable display names derived from node identities.
//!
//! The md5 digest of the id picks two adjectives and an animal, so the name
//! is stable everywhere without any shared registry.

use crate::types::NodeId;

#[rustfmt::skip]
const ADJECTIVES: &[&str] = &[
    "agile", "alert", "arctic", "armored", "bold", "bristly", "burrowing", "clawed",
    "crested", "cunning", "curious", "dappled", "darting", "deft", "docile", "downy",
    "eager", "elusive", "feathered", "fierce", "fleet", "fluffy", "foraging", "freckled",
    "frisky", "gentle", "gilded", "gliding", "graceful", "hardy", "horned", "howling",
    "keen", "lanky", "lithe", "lumbering", "majestic", "masked", "mighty", "nimble",
    "nocturnal", "pensive", "playful", "plump", "pouncing", "prowling", "quick", "regal",
    "restless", "roaring", "rugged", "scaly", "shaggy", "shrewd", "silent", "silky",
    "sleek", "sly", "spotted", "stealthy", "striped", "sturdy", "swift", "tawny",
    "tenacious", "thorny", "timid", "toothy", "tropical", "vigilant", "wily", "woolly",
];

#[rustfmt::skip]
const ANIMALS: &[&str] = &[
    "albatross", "antelope", "badger", "bison", "bobcat", "capybara", "caribou", "cheetah",
    "condor", "cougar", "coyote", "crane", "dingo", "dolphin", "falcon", "ferret",
    "finch", "gazelle", "gecko", "gibbon", "heron", "hornet", "ibis", "iguana",
    "jackal", "jaguar", "kestrel", "lemur", "leopard", "lynx", "macaque", "magpie",
    "mallard", "manatee", "marmot", "meerkat", "mongoose", "narwhal", "ocelot", "okapi",
    "osprey", "otter", "panther", "pelican", "porpoise", "puffin", "raccoon", "raven",
    "salamander", "sandpiper", "seahorse", "shrike", "stoat", "stork", "tamarin", "tapir",
    "toucan", "viper", "vole", "wallaby", "walrus", "weasel", "wombat", "wren",
];

/// Derive the display name for a node id.
pub fn name_from_node_id(node_id: &str, no_spaces: bool) -> String {
    let digest = md5::compute(node_id.as_bytes()).0;
    let adj1 = ADJECTIVES[digest[2] as usize % ADJECTIVES.len()];
    let adj2 = ADJECTIVES[digest[1] as usize % ADJECTIVES.len()];
    let animal = ANIMALS[digest[0] as usize % ANIMALS.len()];

    let sep = if no_spaces { "_" } else { " " };
    format!("{adj1}{sep}{adj2}{sep}{animal}")
}

/// Reverse lookup over a candidate list; names are not invertible otherwise.
pub fn search_node_ids_for_name<'a>(node_ids: &'a [NodeId], name: &str) -> Option<&'a NodeId> {
    node_ids.iter().find(|id| name_from_node_id(id, false) == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_stable() {
        let a = name_from_node_id("QmPeer1234", false);
        let b = name_from_node_id("QmPeer1234", false);
        assert_eq!(a, b);
        assert_eq!(a.split(' ').count(), 3);
    }

    #[test]
    fn test_no_spaces_variant() {
        let spaced = name_from_node_id("QmPeer1234", false);
        let underscored = name_from_node_id("QmPeer1234", true);
        assert_eq!(spaced.replace(' ', "_"), underscored);
    }

    #[test]
    fn test_search_roundtrip() {
        let ids: Vec<NodeId> = vec!["a".into(), "b".into(), "c".into()];
        let name = name_from_node_id("b", false);
        assert_eq!(search_node_ids_for_name(&ids, &name), Some(&"b".to_string()));
        assert_eq!(search_node_ids_for_name(&ids, "no such animal"), None);
    }
}
