//! OVA archive creation.
//!
//! This module handles creating OVA (Open Virtual Appliance) archives,
//! which are TAR files containing OVF descriptors and disk images.

// TODO: Implement OVA creation
// - Create TAR archive with correct ordering (OVF first)
// - Stream files without full buffering
// - Calculate and embed checksums
// - Support manifest file generation
