// Use the "built" crate to generate some useful build-time information,
// including the git hash and compiler version.
fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");
}
