//! Behavioural scenarios for `clonekit deploy` phase sequencing.

mod phases;
