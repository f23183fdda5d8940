mod helpers;

mod manifest_tests;
mod recovery_tests;
mod selection_tests;
