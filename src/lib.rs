pub mod keyvalue;
pub mod raft;

#[cfg(test)]
mod harness;
#[cfg(test)]
mod testing;
