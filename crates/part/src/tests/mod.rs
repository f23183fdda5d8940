mod helpers;

mod block_tests;
mod merge_tests;
