//! VMX file parsing.
//!
//! This module handles parsing VMware VMX configuration files to extract
//! VM metadata and disk references.

// TODO: Implement VMX parsing
// - Parse key=value pairs
// - Extract VM name, memory, CPUs
// - Find VMDK references
// - Handle quoted values
