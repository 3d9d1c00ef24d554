mod catalog;
mod reliability;
