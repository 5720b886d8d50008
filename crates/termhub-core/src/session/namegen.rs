//! Generated session ids.
//!
//! Sessions started without a name get a readable `adjective-noun` id such
//! as `brisk-otter`, so they can still be typed back on the command line.

use rand::RngExt;

const ADJECTIVES: &[&str] = &[
    "agile", "amber", "bold", "brave", "brisk", "bright", "calm", "clever", "cosmic", "crisp",
    "daring", "eager", "early", "fancy", "fleet", "frosty", "gentle", "gleaming", "golden",
    "happy", "hasty", "humble", "jolly", "keen", "kind", "lively", "lucky", "mellow", "merry",
    "mighty", "nimble", "noble", "patient", "plucky", "proud", "quick", "quiet", "rapid",
    "rustic", "sharp", "shiny", "silent", "snappy", "steady", "sturdy", "sunny", "swift",
    "tidy", "vivid", "witty",
];

const NOUNS: &[&str] = &[
    "anvil", "badger", "beacon", "bison", "compass", "condor", "cricket", "falcon", "ferret",
    "finch", "gecko", "harbor", "hawk", "heron", "ibex", "jackal", "kestrel", "koala", "lantern",
    "lark", "lemur", "lynx", "magpie", "marten", "meadow", "mole", "narwhal", "newt", "ocelot",
    "orca", "osprey", "otter", "owl", "panda", "pebble", "pelican", "puffin", "quail", "raven",
    "robin", "salmon", "sparrow", "spindle", "tapir", "thrush", "toucan", "walrus", "weasel",
    "wren", "yak",
];

/// A random `adjective-noun` pair
pub fn generate_name() -> String {
    let mut rng = rand::rng();
    let adj = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.random_range(0..NOUNS.len())];
    format!("{}-{}", adj, noun)
}

/// A generated name for which `taken` returns false.
///
/// After a handful of random collisions a numeric suffix is appended until
/// the name is free.
pub fn generate_unique_name<F>(taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    for _ in 0..16 {
        let name = generate_name();
        if !taken(&name) {
            return name;
        }
    }
    let base = generate_name();
    (2u64..)
        .map(|n| format!("{}-{}", base, n))
        .find(|name| !taken(name))
        .unwrap_or(base)
}
