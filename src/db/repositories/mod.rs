mod entries;
mod outputs;
