mod test_device;
