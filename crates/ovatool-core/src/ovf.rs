//! OVF descriptor generation.
//!
//! This module generates OVF (Open Virtualization Format) XML descriptors
//! from VMX metadata.

// TODO: Implement OVF generation
// - Build OVF XML structure
// - Include hardware section (CPU, memory, disks, networks)
// - Generate file references with sizes and checksums
// - Support OVF 1.0 and 2.0 schemas
