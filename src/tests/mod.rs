mod bloom_tests;
mod bulk_set_ack_tests;
mod checksum_tests;
mod locmap_tests;
mod persistence_tests;
mod pull_replication_tests;
mod store_tests;
mod util;
